//! Package-manager install outcomes
//!
//! The status taxonomy is closed and its codes are reproduced verbatim:
//! downstream tooling branches on them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

macro_rules! install_statuses {
    ($($variant:ident => $code:literal,)*) => {
        /// Outcome of a package-manager install
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum InstallStatus {
            $(
                #[serde(rename = $code)]
                $variant,
            )*
        }

        impl InstallStatus {
            /// Every status, in declaration order
            pub const ALL: &'static [InstallStatus] = &[$(InstallStatus::$variant,)*];

            /// Verbatim status code
            pub fn as_code(&self) -> &'static str {
                match self {
                    $(InstallStatus::$variant => $code,)*
                }
            }

            /// Parse a verbatim status code
            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some(InstallStatus::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

install_statuses! {
    Ok => "OK",

    InstallFailedAborted => "INSTALL_FAILED_ABORTED",
    InstallFailedAlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
    InstallFailedBadDexMetadata => "INSTALL_FAILED_BAD_DEX_METADATA",
    InstallFailedBadSignature => "INSTALL_FAILED_BAD_SIGNATURE",
    InstallFailedConflictingProvider => "INSTALL_FAILED_CONFLICTING_PROVIDER",
    InstallFailedContainerError => "INSTALL_FAILED_CONTAINER_ERROR",
    InstallFailedCpuAbiIncompatible => "INSTALL_FAILED_CPU_ABI_INCOMPATIBLE",
    InstallFailedDexopt => "INSTALL_FAILED_DEXOPT",
    InstallFailedDuplicatePackage => "INSTALL_FAILED_DUPLICATE_PACKAGE",
    InstallFailedDuplicatePermission => "INSTALL_FAILED_DUPLICATE_PERMISSION",
    InstallFailedInstantAppInvalid => "INSTALL_FAILED_INSTANT_APP_INVALID",
    InstallFailedInsufficientStorage => "INSTALL_FAILED_INSUFFICIENT_STORAGE",
    InstallFailedInternalError => "INSTALL_FAILED_INTERNAL_ERROR",
    InstallFailedInvalidApk => "INSTALL_FAILED_INVALID_APK",
    InstallFailedInvalidInstallLocation => "INSTALL_FAILED_INVALID_INSTALL_LOCATION",
    InstallFailedInvalidUri => "INSTALL_FAILED_INVALID_URI",
    InstallFailedMediaUnavailable => "INSTALL_FAILED_MEDIA_UNAVAILABLE",
    InstallFailedMissingFeature => "INSTALL_FAILED_MISSING_FEATURE",
    InstallFailedMissingSharedLibrary => "INSTALL_FAILED_MISSING_SHARED_LIBRARY",
    InstallFailedMissingSplit => "INSTALL_FAILED_MISSING_SPLIT",
    InstallFailedMultipackageInconsistency => "INSTALL_FAILED_MULTIPACKAGE_INCONSISTENCY",
    InstallFailedNewerSdk => "INSTALL_FAILED_NEWER_SDK",
    InstallFailedNoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
    InstallFailedNoSharedUser => "INSTALL_FAILED_NO_SHARED_USER",
    InstallFailedOlderSdk => "INSTALL_FAILED_OLDER_SDK",
    InstallFailedOtherStagedSessionInProgress => "INSTALL_FAILED_OTHER_STAGED_SESSION_IN_PROGRESS",
    InstallFailedPackageChanged => "INSTALL_FAILED_PACKAGE_CHANGED",
    InstallFailedPermissionModelDowngrade => "INSTALL_FAILED_PERMISSION_MODEL_DOWNGRADE",
    InstallFailedReplaceCouldntDelete => "INSTALL_FAILED_REPLACE_COULDNT_DELETE",
    InstallFailedSandboxVersionDowngrade => "INSTALL_FAILED_SANDBOX_VERSION_DOWNGRADE",
    InstallFailedSharedUserIncompatible => "INSTALL_FAILED_SHARED_USER_INCOMPATIBLE",
    InstallFailedTestOnly => "INSTALL_FAILED_TEST_ONLY",
    InstallFailedUidChanged => "INSTALL_FAILED_UID_CHANGED",
    InstallFailedUpdateIncompatible => "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
    InstallFailedUserRestricted => "INSTALL_FAILED_USER_RESTRICTED",
    InstallFailedVerificationFailure => "INSTALL_FAILED_VERIFICATION_FAILURE",
    InstallFailedVerificationTimeout => "INSTALL_FAILED_VERIFICATION_TIMEOUT",
    InstallFailedVersionDowngrade => "INSTALL_FAILED_VERSION_DOWNGRADE",
    InstallFailedWrongInstalledVersion => "INSTALL_FAILED_WRONG_INSTALLED_VERSION",
    InstallParseFailedBadManifest => "INSTALL_PARSE_FAILED_BAD_MANIFEST",
    InstallParseFailedBadPackageName => "INSTALL_PARSE_FAILED_BAD_PACKAGE_NAME",
    InstallParseFailedBadSharedUserId => "INSTALL_PARSE_FAILED_BAD_SHARED_USER_ID",
    InstallParseFailedCertificateEncoding => "INSTALL_PARSE_FAILED_CERTIFICATE_ENCODING",
    InstallParseFailedInconsistentCertificates => "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES",
    InstallParseFailedManifestEmpty => "INSTALL_PARSE_FAILED_MANIFEST_EMPTY",
    InstallParseFailedManifestMalformed => "INSTALL_PARSE_FAILED_MANIFEST_MALFORMED",
    InstallParseFailedNoCertificates => "INSTALL_PARSE_FAILED_NO_CERTIFICATES",
    InstallParseFailedNotApk => "INSTALL_PARSE_FAILED_NOT_APK",
    InstallParseFailedUnexpectedException => "INSTALL_PARSE_FAILED_UNEXPECTED_EXCEPTION",

    DeviceNotResponding => "DEVICE_NOT_RESPONDING",
    InconsistentCertificates => "INCONSISTENT_CERTIFICATES",
    NoCertificate => "NO_CERTIFICATE",
    DeviceNotFound => "DEVICE_NOT_FOUND",
    ShellUnresponsive => "SHELL_UNRESPONSIVE",
    MultiApksNoSupportedBelow21 => "MULTI_APKS_NO_SUPPORTED_BELOW21",
    UnknownError => "UNKNOWN_ERROR",
    SkippedInstall => "SKIPPED_INSTALL",
}

impl InstallStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, InstallStatus::Ok | InstallStatus::SkippedInstall)
    }
}

impl std::fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Status plus the package manager's message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResult {
    pub status: InstallStatus,
    pub message: String,
}

impl InstallResult {
    pub fn new(status: InstallStatus, message: impl Into<String>) -> Self {
        InstallResult {
            status,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(InstallStatus::Ok, "")
    }

    /// Map a vendor failure code; unrecognized codes become `UNKNOWN_ERROR`.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match InstallStatus::from_code(code) {
            Some(status) => Self::new(status, message),
            None => {
                warn!("Unrecognized installation failure: {}\n{}", code, message);
                Self::new(InstallStatus::UnknownError, format!("{}: {}", code, message))
            }
        }
    }
}

fn failure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Failure \[([A-Z0-9_]+)(?::\s*([^\]]*))?\]").expect("static regex is valid")
    })
}

/// Classify the output of a `pm install` family command.
pub fn parse_install_output(output: &str) -> InstallResult {
    let trimmed = output.trim();
    if let Some(caps) = failure_pattern().captures(trimmed) {
        let code = caps.get(1).map_or("", |m| m.as_str());
        let message = caps.get(2).map_or("", |m| m.as_str().trim());
        return InstallResult::from_code(code, message);
    }

    if trimmed.lines().any(|line| line.trim_start().starts_with("Success")) {
        return InstallResult::ok();
    }

    warn!("Installation failure without status code: {}", trimmed);
    InstallResult::new(InstallStatus::UnknownError, trimmed)
}
