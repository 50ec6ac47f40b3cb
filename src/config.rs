use std::time::Duration;

/// RTMFP engine configuration.
#[derive(Clone, Debug)]
pub struct Config {
    availability_update_period: Duration,
    window_duration: Duration,
    is_publisher: bool,
    audio_reliable: bool,
    video_reliable: bool,
    socket_receive_buffer: Option<usize>,
    socket_send_buffer: Option<usize>,
    keepalive_interval: Duration,
    keepalive_attempts: u32,
    handshake_attempts: u32,
    cookie_lifetime: Duration,
    close_linger: Duration,
    manage_interval: Duration,
    call_timeout: Duration,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            availability_update_period: Duration::from_millis(100),
            window_duration: Duration::from_secs(8),
            is_publisher: false,
            audio_reliable: false,
            video_reliable: false,
            socket_receive_buffer: None,
            socket_send_buffer: None,
            keepalive_interval: Duration::from_secs(95),
            keepalive_attempts: 11,
            handshake_attempts: 9,
            cookie_lifetime: Duration::from_secs(95),
            close_linger: Duration::from_secs(90),
            manage_interval: Duration::from_millis(50),
            call_timeout: Duration::from_secs(10),
            rng_seed: None,
        }
    }

    /// NetGroup fragment-map advertisement cadence.
    #[inline(always)]
    pub fn availability_update_period(&self) -> Duration {
        self.availability_update_period
    }

    /// NetGroup retention window.
    #[inline(always)]
    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Whether this endpoint publishes into the group it joins.
    #[inline(always)]
    pub fn is_publisher(&self) -> bool {
        self.is_publisher
    }

    /// Retransmit lost audio messages instead of abandoning them.
    #[inline(always)]
    pub fn audio_reliable(&self) -> bool {
        self.audio_reliable
    }

    /// Retransmit lost video messages instead of abandoning them.
    #[inline(always)]
    pub fn video_reliable(&self) -> bool {
        self.video_reliable
    }

    /// SO_RCVBUF for the UDP sockets, if set.
    #[inline(always)]
    pub fn socket_receive_buffer(&self) -> Option<usize> {
        self.socket_receive_buffer
    }

    /// SO_SNDBUF for the UDP sockets, if set.
    #[inline(always)]
    pub fn socket_send_buffer(&self) -> Option<usize> {
        self.socket_send_buffer
    }

    /// Idle time before a keepalive is sent on an established session.
    #[inline(always)]
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Unanswered keepalives before the session fails.
    #[inline(always)]
    pub fn keepalive_attempts(&self) -> u32 {
        self.keepalive_attempts
    }

    /// Handshake probe attempts before giving up.
    #[inline(always)]
    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts
    }

    /// How long a responder cookie stays valid.
    #[inline(always)]
    pub fn cookie_lifetime(&self) -> Duration {
        self.cookie_lifetime
    }

    /// Quiet time in NEAR_CLOSED before the session is torn down.
    #[inline(always)]
    pub fn close_linger(&self) -> Duration {
        self.close_linger
    }

    /// Cadence of the manage tick (flush, ping, retransmit).
    #[inline(always)]
    pub fn manage_interval(&self) -> Duration {
        self.manage_interval
    }

    /// Timeout applied to blocking host calls.
    #[inline(always)]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Optional seed for non-cryptographic randomness (deterministic tests).
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    availability_update_period: Duration,
    window_duration: Duration,
    is_publisher: bool,
    audio_reliable: bool,
    video_reliable: bool,
    socket_receive_buffer: Option<usize>,
    socket_send_buffer: Option<usize>,
    keepalive_interval: Duration,
    keepalive_attempts: u32,
    handshake_attempts: u32,
    cookie_lifetime: Duration,
    close_linger: Duration,
    manage_interval: Duration,
    call_timeout: Duration,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the NetGroup fragment-map advertisement cadence.
    ///
    /// Defaults to 100 ms.
    pub fn availability_update_period(mut self, period: Duration) -> Self {
        self.availability_update_period = period;
        self
    }

    /// Set the NetGroup retention window.
    ///
    /// Defaults to 8 seconds.
    pub fn window_duration(mut self, duration: Duration) -> Self {
        self.window_duration = duration;
        self
    }

    /// Join groups as a publisher.
    ///
    /// Defaults to false.
    pub fn is_publisher(mut self, publisher: bool) -> Self {
        self.is_publisher = publisher;
        self
    }

    /// Retransmit lost audio messages instead of abandoning them.
    ///
    /// Defaults to false.
    pub fn audio_reliable(mut self, reliable: bool) -> Self {
        self.audio_reliable = reliable;
        self
    }

    /// Retransmit lost video messages instead of abandoning them.
    ///
    /// Defaults to false.
    pub fn video_reliable(mut self, reliable: bool) -> Self {
        self.video_reliable = reliable;
        self
    }

    /// Set SO_RCVBUF on the UDP sockets.
    pub fn socket_receive_buffer(mut self, bytes: usize) -> Self {
        self.socket_receive_buffer = Some(bytes);
        self
    }

    /// Set SO_SNDBUF on the UDP sockets.
    pub fn socket_send_buffer(mut self, bytes: usize) -> Self {
        self.socket_send_buffer = Some(bytes);
        self
    }

    /// Set the idle time before a keepalive is sent.
    ///
    /// Defaults to 95 seconds.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set how many unanswered keepalives fail the session.
    ///
    /// Defaults to 11.
    pub fn keepalive_attempts(mut self, attempts: u32) -> Self {
        self.keepalive_attempts = attempts;
        self
    }

    /// Set how many handshake probes are sent before giving up.
    ///
    /// Defaults to 9.
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.handshake_attempts = attempts;
        self
    }

    /// Set the responder cookie lifetime.
    ///
    /// Defaults to 95 seconds.
    pub fn cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Set the quiet time in NEAR_CLOSED before teardown.
    ///
    /// Defaults to 90 seconds.
    pub fn close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = linger;
        self
    }

    /// Set the manage tick cadence.
    ///
    /// Defaults to 50 ms.
    pub fn manage_interval(mut self, interval: Duration) -> Self {
        self.manage_interval = interval;
        self
    }

    /// Set the timeout for blocking host calls.
    ///
    /// Defaults to 10 seconds.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Seed the non-cryptographic RNG for deterministic behavior.
    ///
    /// Tags and cookies become predictable; key material is unaffected.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            availability_update_period: self.availability_update_period,
            window_duration: self.window_duration,
            is_publisher: self.is_publisher,
            audio_reliable: self.audio_reliable,
            video_reliable: self.video_reliable,
            socket_receive_buffer: self.socket_receive_buffer,
            socket_send_buffer: self.socket_send_buffer,
            keepalive_interval: self.keepalive_interval,
            keepalive_attempts: self.keepalive_attempts,
            handshake_attempts: self.handshake_attempts,
            cookie_lifetime: self.cookie_lifetime,
            close_linger: self.close_linger,
            manage_interval: self.manage_interval,
            call_timeout: self.call_timeout,
            rng_seed: self.rng_seed,
        }
    }
}
