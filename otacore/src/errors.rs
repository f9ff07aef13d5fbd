//! Protocol error codes shared between the attempt pipeline and the server.
//!
//! `ErrorCode` is a closed wire-value enum, not a Rust error type: every
//! stage failure collapses into one of these values, which is what gets
//! reported back to the update server in an `<event>` element and what
//! drives the URL failover bookkeeping in [`crate::payload_state`].
//! Codes received from outside that we do not recognize become
//! `Unknown(code)` instead of silently aliasing a known value.

use std::fmt;

/// How a failure affects the URL failover state.
///
/// See [`ErrorCode::failover_action`] for the classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// The error indicts the current URL (or its transport path); move to
    /// the next candidate URL immediately.
    NextUrl,
    /// Transient network-ish failure: penalize the current URL by one
    /// failure count but keep using it until the per-URL limit is reached.
    CountFailure,
    /// Not attributable to any URL; leave the failover state untouched.
    Ignore,
}

/// Wire error codes for update attempt outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    Error,
    OmahaRequestError,
    OmahaResponseHandlerError,
    FilesystemCopierError,
    PostinstallRunnerError,
    PayloadMismatchedType,
    InstallDeviceOpenError,
    KernelDeviceOpenError,
    DownloadTransferError,
    PayloadHashMismatchError,
    PayloadSizeMismatchError,
    DownloadPayloadVerificationError,
    DownloadNewPartitionInfoError,
    DownloadWriteError,
    NewRootfsVerificationError,
    NewKernelVerificationError,
    SignedDeltaPayloadExpectedError,
    DownloadPayloadPubKeyVerificationError,
    PostinstallBootedFromFirmwareB,
    DownloadStateInitializationError,
    DownloadInvalidMetadataMagicString,
    DownloadSignatureMissingInManifest,
    DownloadManifestParseError,
    DownloadMetadataSignatureError,
    DownloadMetadataSignatureVerificationError,
    DownloadMetadataSignatureMismatch,
    DownloadOperationHashVerificationError,
    DownloadOperationExecutionError,
    DownloadOperationHashMismatch,
    OmahaRequestEmptyResponseError,
    OmahaRequestXmlParseError,
    DownloadInvalidMetadataSize,
    DownloadInvalidMetadataSignature,
    OmahaResponseInvalid,
    OmahaUpdateIgnoredPerPolicy,
    OmahaUpdateDeferredPerPolicy,
    OmahaErrorInHttpResponse,
    DownloadOperationHashMissingError,
    DownloadMetadataSignatureMissingError,
    OmahaUpdateDeferredForBackoff,
    PostinstallPowerwashError,
    UpdateCanceledByChannelChange,
    PostinstallFirmwareRoNotUpdatable,
    UnsupportedMajorPayloadVersion,
    UnsupportedMinorPayloadVersion,
    OmahaRequestXmlHasEntityDecl,
    FilesystemVerifierError,
    UserCanceled,
    NonCriticalUpdateInOobe,
    OmahaUpdateIgnoredOverCellular,
    PayloadTimestampError,
    UpdatedButNotActive,
    NoUpdate,
    RollbackNotPossible,
    RollbackVersionError,
    VerityCalculationError,
    /// HTTP status returned by the update server when it was not 2xx.
    HttpResponse(u16),
    /// Code received on the wire that this client does not recognize.
    Unknown(u32),
}

/// Wire values for HTTP-status error codes start at this base, so a
/// status of 404 travels as `2404`.
const HTTP_RESPONSE_BASE: u32 = 2000;

impl ErrorCode {
    /// The numeric value used in `<event errorcode="..">` attributes.
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::OmahaRequestError => 2,
            Self::OmahaResponseHandlerError => 3,
            Self::FilesystemCopierError => 4,
            Self::PostinstallRunnerError => 5,
            Self::PayloadMismatchedType => 6,
            Self::InstallDeviceOpenError => 7,
            Self::KernelDeviceOpenError => 8,
            Self::DownloadTransferError => 9,
            Self::PayloadHashMismatchError => 10,
            Self::PayloadSizeMismatchError => 11,
            Self::DownloadPayloadVerificationError => 12,
            Self::DownloadNewPartitionInfoError => 13,
            Self::DownloadWriteError => 14,
            Self::NewRootfsVerificationError => 15,
            Self::NewKernelVerificationError => 16,
            Self::SignedDeltaPayloadExpectedError => 17,
            Self::DownloadPayloadPubKeyVerificationError => 18,
            Self::PostinstallBootedFromFirmwareB => 19,
            Self::DownloadStateInitializationError => 20,
            Self::DownloadInvalidMetadataMagicString => 21,
            Self::DownloadSignatureMissingInManifest => 22,
            Self::DownloadManifestParseError => 23,
            Self::DownloadMetadataSignatureError => 24,
            Self::DownloadMetadataSignatureVerificationError => 25,
            Self::DownloadMetadataSignatureMismatch => 26,
            Self::DownloadOperationHashVerificationError => 27,
            Self::DownloadOperationExecutionError => 28,
            Self::DownloadOperationHashMismatch => 29,
            Self::OmahaRequestEmptyResponseError => 30,
            Self::OmahaRequestXmlParseError => 31,
            Self::DownloadInvalidMetadataSize => 32,
            Self::DownloadInvalidMetadataSignature => 33,
            Self::OmahaResponseInvalid => 34,
            Self::OmahaUpdateIgnoredPerPolicy => 35,
            Self::OmahaUpdateDeferredPerPolicy => 36,
            Self::OmahaErrorInHttpResponse => 37,
            Self::DownloadOperationHashMissingError => 38,
            Self::DownloadMetadataSignatureMissingError => 39,
            Self::OmahaUpdateDeferredForBackoff => 40,
            Self::PostinstallPowerwashError => 41,
            Self::UpdateCanceledByChannelChange => 42,
            Self::PostinstallFirmwareRoNotUpdatable => 43,
            Self::UnsupportedMajorPayloadVersion => 44,
            Self::UnsupportedMinorPayloadVersion => 45,
            Self::OmahaRequestXmlHasEntityDecl => 46,
            Self::FilesystemVerifierError => 47,
            Self::UserCanceled => 48,
            Self::NonCriticalUpdateInOobe => 49,
            Self::OmahaUpdateIgnoredOverCellular => 50,
            Self::PayloadTimestampError => 51,
            Self::UpdatedButNotActive => 52,
            Self::NoUpdate => 53,
            Self::RollbackNotPossible => 54,
            Self::RollbackVersionError => 55,
            Self::VerityCalculationError => 56,
            Self::HttpResponse(status) => HTTP_RESPONSE_BASE + status as u32,
            Self::Unknown(code) => code,
        }
    }

    /// Inverse of [`ErrorCode::code`]; unrecognized values map to
    /// `Unknown(code)`.
    pub fn from_code(code: u32) -> Self {
        if (HTTP_RESPONSE_BASE..HTTP_RESPONSE_BASE + 1000).contains(&code) {
            return Self::HttpResponse((code - HTTP_RESPONSE_BASE) as u16);
        }
        match code {
            0 => Self::Success,
            1 => Self::Error,
            2 => Self::OmahaRequestError,
            3 => Self::OmahaResponseHandlerError,
            4 => Self::FilesystemCopierError,
            5 => Self::PostinstallRunnerError,
            6 => Self::PayloadMismatchedType,
            7 => Self::InstallDeviceOpenError,
            8 => Self::KernelDeviceOpenError,
            9 => Self::DownloadTransferError,
            10 => Self::PayloadHashMismatchError,
            11 => Self::PayloadSizeMismatchError,
            12 => Self::DownloadPayloadVerificationError,
            13 => Self::DownloadNewPartitionInfoError,
            14 => Self::DownloadWriteError,
            15 => Self::NewRootfsVerificationError,
            16 => Self::NewKernelVerificationError,
            17 => Self::SignedDeltaPayloadExpectedError,
            18 => Self::DownloadPayloadPubKeyVerificationError,
            19 => Self::PostinstallBootedFromFirmwareB,
            20 => Self::DownloadStateInitializationError,
            21 => Self::DownloadInvalidMetadataMagicString,
            22 => Self::DownloadSignatureMissingInManifest,
            23 => Self::DownloadManifestParseError,
            24 => Self::DownloadMetadataSignatureError,
            25 => Self::DownloadMetadataSignatureVerificationError,
            26 => Self::DownloadMetadataSignatureMismatch,
            27 => Self::DownloadOperationHashVerificationError,
            28 => Self::DownloadOperationExecutionError,
            29 => Self::DownloadOperationHashMismatch,
            30 => Self::OmahaRequestEmptyResponseError,
            31 => Self::OmahaRequestXmlParseError,
            32 => Self::DownloadInvalidMetadataSize,
            33 => Self::DownloadInvalidMetadataSignature,
            34 => Self::OmahaResponseInvalid,
            35 => Self::OmahaUpdateIgnoredPerPolicy,
            36 => Self::OmahaUpdateDeferredPerPolicy,
            37 => Self::OmahaErrorInHttpResponse,
            38 => Self::DownloadOperationHashMissingError,
            39 => Self::DownloadMetadataSignatureMissingError,
            40 => Self::OmahaUpdateDeferredForBackoff,
            41 => Self::PostinstallPowerwashError,
            42 => Self::UpdateCanceledByChannelChange,
            43 => Self::PostinstallFirmwareRoNotUpdatable,
            44 => Self::UnsupportedMajorPayloadVersion,
            45 => Self::UnsupportedMinorPayloadVersion,
            46 => Self::OmahaRequestXmlHasEntityDecl,
            47 => Self::FilesystemVerifierError,
            48 => Self::UserCanceled,
            49 => Self::NonCriticalUpdateInOobe,
            50 => Self::OmahaUpdateIgnoredOverCellular,
            51 => Self::PayloadTimestampError,
            52 => Self::UpdatedButNotActive,
            53 => Self::NoUpdate,
            54 => Self::RollbackNotPossible,
            55 => Self::RollbackVersionError,
            56 => Self::VerityCalculationError,
            other => Self::Unknown(other),
        }
    }

    /// Classifies this error for the URL failover algorithm.
    ///
    /// Errors that indicate a problem with a particular URL (bad payload
    /// bytes, signature/metadata trouble) advance to the next candidate URL
    /// right away. Plain transport errors only bump the per-URL failure
    /// count so that earlier (cheaper) URLs get more chances. Everything
    /// else happened before or after the download and leaves the failover
    /// state alone.
    pub fn failover_action(self) -> FailoverAction {
        match self {
            Self::PayloadHashMismatchError
            | Self::PayloadSizeMismatchError
            | Self::DownloadPayloadVerificationError
            | Self::DownloadPayloadPubKeyVerificationError
            | Self::SignedDeltaPayloadExpectedError
            | Self::DownloadInvalidMetadataMagicString
            | Self::DownloadSignatureMissingInManifest
            | Self::DownloadManifestParseError
            | Self::DownloadMetadataSignatureError
            | Self::DownloadMetadataSignatureVerificationError
            | Self::DownloadMetadataSignatureMismatch
            | Self::DownloadOperationHashVerificationError
            | Self::DownloadOperationExecutionError
            | Self::DownloadOperationHashMismatch
            | Self::DownloadInvalidMetadataSize
            | Self::DownloadInvalidMetadataSignature
            | Self::DownloadOperationHashMissingError
            | Self::DownloadMetadataSignatureMissingError
            | Self::PayloadMismatchedType
            | Self::UnsupportedMajorPayloadVersion
            | Self::UnsupportedMinorPayloadVersion
            | Self::PayloadTimestampError
            | Self::VerityCalculationError => FailoverAction::NextUrl,

            Self::Error
            | Self::DownloadTransferError
            | Self::DownloadWriteError
            | Self::DownloadStateInitializationError
            | Self::OmahaErrorInHttpResponse
            | Self::HttpResponse(_) => FailoverAction::CountFailure,

            _ => FailoverAction::Ignore,
        }
    }

    /// Deferral reason codes describe an update withheld by policy, not a
    /// failed attempt.
    pub fn is_deferral(self) -> bool {
        matches!(
            self,
            Self::OmahaUpdateDeferredPerPolicy | Self::OmahaUpdateDeferredForBackoff
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpResponse(status) => write!(f, "HttpResponse({})", status),
            Self::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 0..=56 {
            let decoded = ErrorCode::from_code(code);
            assert_eq!(decoded.code(), code);
            assert!(!matches!(decoded, ErrorCode::Unknown(_)));
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let decoded = ErrorCode::from_code(9999);
        assert_eq!(decoded, ErrorCode::Unknown(9999));
        assert_eq!(decoded.code(), 9999);
    }

    #[test]
    fn test_http_response_codes() {
        let decoded = ErrorCode::from_code(2404);
        assert_eq!(decoded, ErrorCode::HttpResponse(404));
        assert_eq!(decoded.code(), 2404);
    }

    #[test]
    fn test_hash_mismatch_advances_url() {
        assert_eq!(
            ErrorCode::PayloadHashMismatchError.failover_action(),
            FailoverAction::NextUrl
        );
    }

    #[test]
    fn test_transfer_error_counts_failure() {
        assert_eq!(
            ErrorCode::DownloadTransferError.failover_action(),
            FailoverAction::CountFailure
        );
        assert_eq!(
            ErrorCode::HttpResponse(503).failover_action(),
            FailoverAction::CountFailure
        );
    }

    #[test]
    fn test_policy_codes_leave_failover_alone() {
        assert_eq!(
            ErrorCode::OmahaUpdateDeferredPerPolicy.failover_action(),
            FailoverAction::Ignore
        );
        assert_eq!(
            ErrorCode::NonCriticalUpdateInOobe.failover_action(),
            FailoverAction::Ignore
        );
        assert_eq!(ErrorCode::NoUpdate.failover_action(), FailoverAction::Ignore);
    }

    #[test]
    fn test_deferral_predicate() {
        assert!(ErrorCode::OmahaUpdateDeferredForBackoff.is_deferral());
        assert!(!ErrorCode::OmahaUpdateIgnoredPerPolicy.is_deferral());
    }
}
