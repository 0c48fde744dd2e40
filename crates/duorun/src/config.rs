use duorpc::RouterConfig;

/// Channel preload failures are reported on.
pub const PRELOAD_ERROR: &str = "PRELOAD_ERROR";

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Channel failures are reported on as `[script_path, error]`.
    pub error_channel: String,
    /// Reported to scripts by `process.platform`.
    pub platform: String,
    /// Fuel each script may burn; `None` is unmetered.
    pub fuel: Option<u64>,
    pub is_main_frame: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            error_channel: PRELOAD_ERROR.to_string(),
            platform: std::env::consts::OS.to_string(),
            fuel: None,
            is_main_frame: true,
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_channel(mut self, channel: impl Into<String>) -> Self {
        self.error_channel = channel.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_fuel(mut self, fuel: Option<u64>) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn with_main_frame(mut self, is_main_frame: bool) -> Self {
        self.is_main_frame = is_main_frame;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct HostConfig {
    pub router: RouterConfig,
    pub loader: LoaderConfig,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }
}
