use std::sync::LazyLock;

pub struct DemoConfig {
    fps: u32,
    width: u32,
    height: u32,
    frames: u64,
    output: String,
}

impl DemoConfig {
    pub fn from_env() -> Self {
        Self {
            fps: env_or("FRAME_EXPORT_FPS", 30),
            width: env_or("FRAME_EXPORT_WIDTH", 641),
            height: env_or("FRAME_EXPORT_HEIGHT", 481),
            frames: env_or("FRAME_EXPORT_FRAMES", 90),
            output: std::env::var("FRAME_EXPORT_OUTPUT").unwrap_or_else(|_| "export".to_string()),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Output path without extension; the chosen container supplies it.
    pub fn output(&self) -> &str {
        &self.output
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("ignoring invalid {}={:?}", key, value);
            default
        }),
        Err(_) => default,
    }
}

pub fn config() -> &'static DemoConfig {
    static CONFIG: LazyLock<DemoConfig> = LazyLock::new(DemoConfig::from_env);
    &CONFIG
}
