//! Various Certa-wide constants.

use std::time::Duration;

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `certad` binary.
pub const CERTA_SERVER_APP: &str = "Certa";

/// The application name used in audit events.
pub const CERTA_AUDIT_APP: &str = "certa";

//------------ Config Files Paths -------------------------------------------

/// The default path to the Certa config file.
pub const CERTA_DEFAULT_CONFIG_FILE: &str = "/etc/certa.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const CERTA_ENV_LOG_LEVEL: &str = "CERTA_LOG_LEVEL";

/// The environment variable with the config file path.
pub const CERTA_ENV_CONFIG: &str = "CERTA_CONFIG";

//------------ Log Targets --------------------------------------------------

/// The log target for audit events.
pub const AUDIT_LOG_TARGET: &str = "certa::audit";

//------------ Issuance -----------------------------------------------------

/// The maximum number of SerialNumber RDN increments tried for a subject.
pub const MAX_SERIAL_NUMBER_INCREMENTS: usize = 100;

/// Warning added when the requested notAfter was changed.
pub const WARN_NOT_AFTER_MODIFIED: &str = "notAfter modified";

/// Warning added when a certificate outlives its CA under the lax mode.
pub const WARN_NOT_AFTER_EXCEEDS_CA: &str = "notAfter exceeds CA validity";

//------------ Paging -------------------------------------------------------

/// Page size used when reading revoked certificates and serial numbers.
pub const STORE_PAGE_SIZE: usize = 100;

/// Page size used when reading the publish queue.
pub const PUBLISH_QUEUE_PAGE_SIZE: usize = 500;

//------------ CRL ----------------------------------------------------------

/// Minutes after an interval boundary during which a CRL may be signed.
pub const CRL_SIGNING_WINDOW_MINUTES: i64 = 20;

/// Minutes within which an existing CRL suppresses a scheduled one.
pub const CRL_RECENT_GUARD_MINUTES: i64 = CRL_SIGNING_WINDOW_MINUTES + 5;

/// The shortest allowed distance between thisUpdate and nextUpdate.
pub const CRL_MIN_NEXT_UPDATE_MINUTES: i64 = 10;

/// Certificates expired this long before thisUpdate are left off a CRL.
pub const CRL_EXPIRED_GRACE_MINUTES: i64 = 10;

/// The object identifier of the certificate set CRL extension.
pub const CRL_CERTSET_OID: &str = "1.3.6.1.4.1.45522.1.1";

pub const MINUTES_PER_DAY: i64 = 24 * 60;

//------------ Scheduling ---------------------------------------------------

/// Period of the scheduled CRL generation job.
pub const SCHEDULER_CRL_PERIOD: Duration = Duration::from_secs(60);

/// Base delay before the first scheduled CRL generation run.
pub const SCHEDULER_CRL_INITIAL_SECONDS: u64 = 60;

/// Period of the expired certificate removal job.
pub const SCHEDULER_EXPIRED_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Base delay in minutes before the first expired certificate removal.
pub const SCHEDULER_EXPIRED_INITIAL_MINUTES: u64 = 24 * 60;

/// Period of the suspended certificate revocation job.
pub const SCHEDULER_SUSPENDED_PERIOD: Duration = Duration::from_secs(3600);

/// Period of the publish queue sweep.
pub const SCHEDULER_PUBLISH_QUEUE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Upper bound for the random extra delay before the first run of a job.
///
/// In seconds for the CRL job and in minutes for the other jobs.
pub const SCHEDULER_JITTER: u64 = 60;

//------------ Signers ------------------------------------------------------

/// Default number of signing contexts per signer pool.
pub const SIGNER_POOL_DEFAULT_SIZE: u32 = 4;

/// How long building a signer pool may wait for its contexts.
pub const SIGNER_POOL_BUILD_TIMEOUT: Duration = Duration::from_secs(10);
