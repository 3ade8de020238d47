use std::time::Duration;

/// Engine wide settings, threaded from the composition root into every
/// account actor and the reconnection controller
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Value of the `User-Agent` header on outgoing requests
    pub user_agent: String,

    /// Expiry requested in REGISTER requests, the registrar may grant less
    pub register_expiry: Duration,

    /// Wait for a final REGISTER response (Timer F)
    pub register_timeout: Duration,

    /// Wait for a final INVITE response on outgoing calls
    pub invite_timeout: Duration,

    /// Wait for a final response to an in-dialog re-INVITE
    pub reinvite_timeout: Duration,

    /// Wait for a BYE response before tearing the call down regardless
    pub bye_timeout: Duration,

    /// Wait for the un-REGISTER on account removal
    pub unregister_timeout: Duration,

    /// Wait for the transport to open
    pub transport_open_timeout: Duration,

    /// Tone duration signaled in DTMF INFO bodies, the inter-digit gap is
    /// this plus 40ms
    pub dtmf_duration: Duration,

    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("tern/", env!("CARGO_PKG_VERSION")).into(),
            register_expiry: Duration::from_secs(600),
            register_timeout: Duration::from_secs(32),
            invite_timeout: Duration::from_secs(180),
            reinvite_timeout: Duration::from_secs(32),
            bye_timeout: Duration::from_secs(5),
            unregister_timeout: Duration::from_secs(5),
            transport_open_timeout: Duration::from_secs(10),
            dtmf_duration: Duration::from_millis(160),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Settings of the reconnection controller
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait after the network comes back before trusting it
    pub stability_delay: Duration,

    /// Per attempt: wait for the recovery registration to conclude
    pub register_timeout: Duration,

    /// Wait for the persistent store when recovering accounts after a
    /// process restart
    pub recovery_timeout: Duration,

    /// First backoff step, doubled per attempt, also the jitter range
    pub backoff_base: Duration,

    /// Backoff ceiling
    pub backoff_max: Duration,

    /// Attempts per trigger before an account is parked as failed
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            stability_delay: Duration::from_secs(3),
            register_timeout: Duration::from_secs(15),
            recovery_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}
