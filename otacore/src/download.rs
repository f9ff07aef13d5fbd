//! Download source classification.
//!
//! Byte counters and attempt metrics are broken down by where the bytes
//! came from: a plain HTTP server, an HTTPS server, or a peer on the local
//! network. The classification is derived from the URL scheme plus whether
//! the URL was obtained through peer discovery.

use std::fmt;

/// Where payload bytes are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadSource {
    /// Plain HTTP to an update server.
    HttpServer,
    /// HTTPS to an update server.
    HttpsServer,
    /// A peer on the local network, over plain HTTP.
    HttpPeer,
}

impl DownloadSource {
    /// All sources, in persistence order.
    pub const ALL: [DownloadSource; 3] = [
        DownloadSource::HttpServer,
        DownloadSource::HttpsServer,
        DownloadSource::HttpPeer,
    ];

    /// Stable name used inside pref keys; renaming one resets its counters.
    pub fn pref_suffix(self) -> &'static str {
        match self {
            DownloadSource::HttpServer => "HttpServer",
            DownloadSource::HttpsServer => "HttpsServer",
            DownloadSource::HttpPeer => "HttpPeer",
        }
    }

    /// Classify a payload URL. `via_peer` marks URLs obtained from peer
    /// discovery rather than the server response.
    pub fn classify(url: &str, via_peer: bool) -> Option<DownloadSource> {
        if via_peer {
            return Some(DownloadSource::HttpPeer);
        }
        let scheme = url.split("://").next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "https" => Some(DownloadSource::HttpsServer),
            "http" => Some(DownloadSource::HttpServer),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pref_suffix())
    }
}
