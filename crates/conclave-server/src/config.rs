//! Runtime configuration.

use std::path::PathBuf;

/// Incoming quench threshold for the per-session message queues (2 MiB).
pub const DEFAULT_QUENCH_BYTES: usize = 2 * 1024 * 1024;

/// Maximum size of one coalesced outbound packet (1 MiB).
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1024 * 1024;

/// Server configuration.
///
/// Assembled by the binary from CLI arguments; tests build it directly with
/// `Default` and override what they need.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g. "0.0.0.0:443")
    pub bind_address: String,
    /// Path to the TLS certificate chain (PEM). Self-signed when absent.
    pub cert_path: Option<PathBuf>,
    /// Path to the TLS private key (PEM). Self-signed when absent.
    pub key_path: Option<PathBuf>,
    /// Database connection URL
    pub database_url: String,
    /// Root of the file storage area; files land under `<root>/<kws-id>/…`
    pub store_root: PathBuf,
    /// Host name advertised to clients for web links
    pub web_host: String,
    /// Local port of the web front-end the web proxy forwards to
    pub web_port: u16,
    /// Local port of the peer service the `00 00 00 04` proxy forwards to
    pub peer_port: u16,
    /// File holding the administrator secret (first token is the secret)
    pub admin_secret_path: PathBuf,
    /// Directory holding screen-share relay credential files
    pub relay_cred_dir: PathBuf,
    /// Path to the screen-share reflector executable
    pub reflector_path: PathBuf,
    /// Path to the signing-ticket validator executable
    pub validator_path: PathBuf,
    /// Path to the maintenance helper executable (store sync, delete)
    pub helper_path: PathBuf,
    /// Path to the mail sender executable
    pub mailer_path: PathBuf,
    /// Sender address for invitation and confirmation mail
    pub mail_sender: String,
    /// Ticket time-to-live enforced on consumption, in seconds
    pub ticket_ttl_secs: u64,
    /// Queue byte count above which a session queue quenches
    pub quench_bytes: usize,
    /// Maximum bytes coalesced into one outbound packet
    pub max_packet_bytes: usize,
    /// Key ids trusted daemon-wide for signing tickets
    pub trusted_key_ids: Vec<u64>,
    /// Default file quota granted to newly created workspaces, in bytes
    pub default_file_quota: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:443".to_owned(),
            cert_path: None,
            key_path: None,
            database_url: "postgres://localhost/conclave".to_owned(),
            store_root: PathBuf::from("/var/cache/conclave/store"),
            web_host: "localhost".to_owned(),
            web_port: 80,
            peer_port: 5000,
            admin_secret_path: PathBuf::from("/etc/conclave/admin_secret"),
            relay_cred_dir: PathBuf::from("/var/cache/conclave/relay"),
            reflector_path: PathBuf::from("/usr/bin/screen-reflector"),
            validator_path: PathBuf::from("/usr/bin/conclave-validate-ticket"),
            helper_path: PathBuf::from("/usr/bin/conclave-helper"),
            mailer_path: PathBuf::from("/usr/sbin/sendmail"),
            mail_sender: "no-reply@localhost".to_owned(),
            ticket_ttl_secs: 300,
            quench_bytes: DEFAULT_QUENCH_BYTES,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            trusted_key_ids: Vec::new(),
            default_file_quota: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Read the administrator secret: first whitespace-delimited token of
    /// the secret file. Empty when the file is absent or blank.
    pub async fn admin_secret(&self) -> String {
        match tokio::fs::read_to_string(&self.admin_secret_path).await {
            Ok(text) => text.split_whitespace().next().unwrap_or("").to_owned(),
            Err(_) => String::new(),
        }
    }
}
