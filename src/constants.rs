//! Global constants for the insights agent.
//!
//! This module centralizes all hardcoded values (well-known paths, marker
//! names, wire headers and exit codes) so the rest of the crate never
//! spells them inline.

// Application identity
/// Name used for the log file and on-disk state
pub const APP_NAME: &str = "insights-client";

/// User-Agent sent with every request to the analysis service
pub const USER_AGENT: &str = concat!("insights-agent/", env!("CARGO_PKG_VERSION"));

// Default locations
/// Default YAML configuration file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/insights-client/insights-client.yaml";

/// Default persistent log file
pub const DEFAULT_LOG_FILE: &str = "/var/log/insights-client/insights-client.log";

/// Directory holding markers, identities and cached rule sets
pub const DEFAULT_STATE_DIR: &str = "/etc/insights-client";

/// Local removal (opt-out) file
pub const DEFAULT_REMOVE_FILE: &str = "/etc/insights-client/remove.conf";

/// Local sed-style normalization expressions
pub const DEFAULT_SED_FILE: &str = "/etc/insights-client/.exp.sed";

/// Keyring used to verify rule-set signatures
pub const DEFAULT_GPG_KEYRING: &str = "/etc/insights-client/redhattools.pub.gpg";

/// Host and path of the analysis service, without scheme
pub const DEFAULT_BASE_URL: &str = "cert-api.access.redhat.com/r/insights";

/// Certificate used for the `CERT` authentication method
pub const DEFAULT_CERT_FILE: &str = "/etc/pki/consumer/cert.pem";

/// Key matching [`DEFAULT_CERT_FILE`]
pub const DEFAULT_KEY_FILE: &str = "/etc/pki/consumer/key.pem";

/// Classic Satellite 5 system registration document
pub const RHN_SYSTEMID_FILE: &str = "/etc/sysconfig/rhn/systemid";

// Rule-set stores
pub const RULES_CACHE_FILE: &str = ".cache.json";
pub const RULES_FALLBACK_FILE: &str = ".fallback.json";
pub const SIGNATURE_SUFFIX: &str = ".asc";

// State markers
pub const REGISTERED_MARKER: &str = ".registered";
pub const UNREGISTERED_MARKER: &str = ".unregistered";
pub const LAST_UPLOAD_MARKER: &str = ".lastupload";
pub const MACHINE_ID_FILE: &str = "machine-id";
pub const DOCKER_GROUP_ID_FILE: &str = "docker-group-id";

/// Permission bits for every file holding rules, identities or markers
pub const PRIVATE_FILE_MODE: u32 = 0o600;

// Upload and retry
/// Default number of upload attempts
pub const DEFAULT_UPLOAD_RETRIES: usize = 1;

/// Fixed delay between upload attempts (5 minutes)
pub const UPLOAD_RETRY_DELAY_SECS: u64 = 300;

/// Default timeout for requests to the analysis service
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

/// Timeout for the lightweight registration status probe
pub const REGISTRATION_CHECK_TIMEOUT_SECS: u64 = 10;

/// Header carrying the collection duration in seconds
pub const COLLECTION_TIME_HEADER: &str = "x-rh-collection-time";

/// Multipart field name of the uploaded bundle
pub const UPLOAD_FIELD_NAME: &str = "file";

// Collection
/// Default per-command timeout (10 minutes)
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Timeout for tool probes (`docker`, `atomic`, `gpg`, `ip`, `hostname`)
pub const PROBE_TIMEOUT_SECS: u64 = 60;

/// Exit status recorded when a command is killed for exceeding its timeout
pub const TIMEOUT_EXIT_STATUS: i32 = 130;

/// Exit status recorded when an executable or file does not exist
pub const NOT_FOUND_EXIT_STATUS: i32 = 127;

/// Exit status reported by shells for non-executable programs
pub const NOT_EXECUTABLE_EXIT_STATUS: i32 = 126;

/// Longest archive file name derived from a command line
pub const MAX_ARCHIVE_NAME_LEN: usize = 255;

/// Executables that are never spawned, whatever the rule set says
pub const COMMAND_DENYLIST: &[&str] = &["rm", "kill", "reboot", "shutdown"];

/// Locale forced on every spawned command
pub const COMMAND_LOCALE: &str = "C";

/// Archive directory holding command output
pub const COMMANDS_DIR: &str = "insights_commands";

/// Longest line handled in one piece; longer lines are filtered in chunks
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Upper bound on concurrently running collection tasks
pub const MAX_CONCURRENT_TASKS: usize = 32;

// Rule placeholders
pub const PLACEHOLDER_MOUNT_POINT: &str = "{CONTAINER_MOUNT_POINT}";
pub const PLACEHOLDER_IMAGE_NAME: &str = "{DOCKER_IMAGE_NAME}";
pub const PLACEHOLDER_CONTAINER_NAME: &str = "{DOCKER_CONTAINER_NAME}";
pub const PLACEHOLDER_EXPANDED_FILE: &str = "{EXPANDED_FILE_NAME}";

// Metadata archive paths
pub const META_ANALYSIS_TARGET: &str = "/insights_data/analysis_target";
pub const META_BRANCH_INFO: &str = "/branch_info";
pub const META_MACHINE_ID: &str = "/insights_data/machine-id";
pub const META_UPLOADER_LOG: &str = "/insights_data/insights_logs/insights.log";
pub const GROUP_METADATA_FILE: &str = "metadata.json";

/// Relative location of the collected hostname, used for hostname redaction
pub const HOSTNAME_ARCHIVE_PATH: &str = "insights_commands/hostname";

// Error messages
pub const ERROR_NOT_REGISTERED: &str = "This machine has not yet been registered.";
pub const ERROR_REGISTER_HINT: &str = "Use --register to register this machine.";
pub const ERROR_ALL_UPLOADS_FAILED: &str = "All attempts to upload have failed!";
pub const ERROR_MUST_BE_ROOT: &str = "Insights must be run as root";
