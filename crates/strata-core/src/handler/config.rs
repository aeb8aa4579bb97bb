//! Operator configuration.

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::HandlerError;
use crate::slice::SliceAssigner;
use crate::time::OriginId;

/// Default per-origin reorder bound.
pub const DEFAULT_MAX_PENDING_SEQUENCES: usize = 1024;

/// What happens to records whose window already triggered.
///
/// # Example
///
/// ```rust
/// use strata_core::handler::LateDataConfig;
///
/// // Route late records to a side output called "late_events"
/// let config = LateDataConfig::with_side_output("late_events".to_string());
/// assert_eq!(config.side_output(), Some("late_events"));
///
/// // Drop late records (default behavior)
/// assert!(LateDataConfig::drop().should_drop());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LateDataConfig {
    /// Name of the side output for late data (None = drop late records)
    side_output: Option<String>,
}

impl LateDataConfig {
    /// Creates a config that drops late records (default behavior).
    #[must_use]
    pub fn drop() -> Self {
        Self { side_output: None }
    }

    /// Creates a config that routes late records to a named side output.
    #[must_use]
    pub fn with_side_output(name: String) -> Self {
        Self {
            side_output: Some(name),
        }
    }

    /// Returns the side output name, if configured.
    #[must_use]
    pub fn side_output(&self) -> Option<&str> {
        self.side_output.as_deref()
    }

    /// Returns true if late records should be dropped.
    #[must_use]
    pub fn should_drop(&self) -> bool {
        self.side_output.is_none()
    }
}

/// Configuration of a window-based operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length
    pub window_size: u64,
    /// Distance between window starts (`== window_size` for tumbling windows)
    pub window_slide: u64,
    /// Grace period after a window's end before it triggers
    pub allowed_lateness: u64,
    /// Size of the worker pool feeding the operator
    pub number_of_worker_threads: usize,
    /// Upstream origins whose watermarks gate triggering
    pub input_origins: Vec<OriginId>,
    /// Origin stamped on emitted window results
    pub output_origin: OriginId,
    /// Out-of-order sequence numbers parked per origin before updates fail
    pub max_pending_sequences: usize,
    /// Late record policy
    pub late_data: LateDataConfig,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            window_slide: 1000,
            allowed_lateness: 0,
            number_of_worker_threads: 1,
            input_origins: vec![OriginId::new(0)],
            output_origin: OriginId::new(u64::MAX),
            max_pending_sequences: DEFAULT_MAX_PENDING_SEQUENCES,
            late_data: LateDataConfig::default(),
        }
    }
}

impl WindowConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> WindowConfigBuilder {
        WindowConfigBuilder::default()
    }

    /// Returns the number of input origins.
    #[must_use]
    pub fn number_of_input_origins(&self) -> usize {
        self.input_origins.len()
    }

    /// Returns true if windows do not overlap.
    #[must_use]
    pub fn is_tumbling(&self) -> bool {
        self.window_size == self.window_slide
    }

    /// Creates the slice assigner for this window shape.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidConfig`] for an invalid size or slide.
    pub fn assigner(&self) -> Result<SliceAssigner, HandlerError> {
        SliceAssigner::new(self.window_size, self.window_slide)
            .map_err(|e| HandlerError::InvalidConfig(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.window_size == 0 {
            return Err(HandlerError::InvalidConfig(
                "window_size must be > 0".to_string(),
            ));
        }
        if self.window_slide == 0 {
            return Err(HandlerError::InvalidConfig(
                "window_slide must be > 0".to_string(),
            ));
        }
        if self.window_slide > self.window_size {
            return Err(HandlerError::InvalidConfig(format!(
                "window_slide ({}) must not exceed window_size ({})",
                self.window_slide, self.window_size
            )));
        }
        if self.number_of_worker_threads == 0 {
            return Err(HandlerError::InvalidConfig(
                "number_of_worker_threads must be > 0".to_string(),
            ));
        }
        if self.input_origins.is_empty() {
            return Err(HandlerError::InvalidConfig(
                "at least one input origin is required".to_string(),
            ));
        }
        let mut seen = FxHashSet::default();
        if let Some(dup) = self.input_origins.iter().find(|o| !seen.insert(**o)) {
            return Err(HandlerError::InvalidConfig(format!(
                "duplicate input origin: {dup}"
            )));
        }
        if self.max_pending_sequences == 0 {
            return Err(HandlerError::InvalidConfig(
                "max_pending_sequences must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`WindowConfig`].
#[derive(Debug, Default)]
pub struct WindowConfigBuilder {
    window_size: Option<u64>,
    window_slide: Option<u64>,
    allowed_lateness: Option<u64>,
    number_of_worker_threads: Option<usize>,
    input_origins: Option<Vec<OriginId>>,
    output_origin: Option<OriginId>,
    max_pending_sequences: Option<usize>,
    late_data: Option<LateDataConfig>,
}

impl WindowConfigBuilder {
    /// Sets a tumbling window of `size`.
    #[must_use]
    pub fn tumbling(mut self, size: u64) -> Self {
        self.window_size = Some(size);
        self.window_slide = Some(size);
        self
    }

    /// Sets a sliding window.
    #[must_use]
    pub fn sliding(mut self, size: u64, slide: u64) -> Self {
        self.window_size = Some(size);
        self.window_slide = Some(slide);
        self
    }

    /// Sets the allowed lateness.
    #[must_use]
    pub fn allowed_lateness(mut self, lateness: u64) -> Self {
        self.allowed_lateness = Some(lateness);
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.number_of_worker_threads = Some(workers);
        self
    }

    /// Sets the input origins.
    #[must_use]
    pub fn input_origins(mut self, origins: impl IntoIterator<Item = OriginId>) -> Self {
        self.input_origins = Some(origins.into_iter().collect());
        self
    }

    /// Sets the origin stamped on results.
    #[must_use]
    pub fn output_origin(mut self, origin: OriginId) -> Self {
        self.output_origin = Some(origin);
        self
    }

    /// Sets the per-origin reorder bound.
    #[must_use]
    pub fn max_pending_sequences(mut self, max: usize) -> Self {
        self.max_pending_sequences = Some(max);
        self
    }

    /// Sets the late record policy.
    #[must_use]
    pub fn late_data(mut self, late_data: LateDataConfig) -> Self {
        self.late_data = Some(late_data);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<WindowConfig, HandlerError> {
        let defaults = WindowConfig::default();
        let config = WindowConfig {
            window_size: self.window_size.unwrap_or(defaults.window_size),
            window_slide: self.window_slide.unwrap_or(defaults.window_slide),
            allowed_lateness: self.allowed_lateness.unwrap_or(defaults.allowed_lateness),
            number_of_worker_threads: self
                .number_of_worker_threads
                .unwrap_or(defaults.number_of_worker_threads),
            input_origins: self.input_origins.unwrap_or(defaults.input_origins),
            output_origin: self.output_origin.unwrap_or(defaults.output_origin),
            max_pending_sequences: self
                .max_pending_sequences
                .unwrap_or(defaults.max_pending_sequences),
            late_data: self.late_data.unwrap_or(defaults.late_data),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins(n: u64) -> Vec<OriginId> {
        (0..n).map(OriginId::new).collect()
    }

    #[test]
    fn test_default_config() {
        let config = WindowConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_tumbling());
        assert_eq!(config.number_of_input_origins(), 1);
        assert!(config.late_data.should_drop());
    }

    #[test]
    fn test_builder() {
        let config = WindowConfig::builder()
            .sliding(10, 5)
            .allowed_lateness(2)
            .workers(4)
            .input_origins(origins(3))
            .output_origin(OriginId::new(99))
            .late_data(LateDataConfig::with_side_output("late".to_string()))
            .build()
            .unwrap();

        assert!(!config.is_tumbling());
        assert_eq!(config.number_of_worker_threads, 4);
        assert_eq!(config.number_of_input_origins(), 3);
        assert_eq!(config.assigner().unwrap().slice_len(), 5);
        assert_eq!(config.late_data.side_output(), Some("late"));
    }

    #[test]
    fn test_validation() {
        let cases = [
            WindowConfig::builder().tumbling(0),
            WindowConfig::builder().sliding(10, 0),
            WindowConfig::builder().sliding(5, 10),
            WindowConfig::builder().workers(0),
            WindowConfig::builder().input_origins(Vec::new()),
            WindowConfig::builder().input_origins([OriginId::new(1), OriginId::new(1)]),
            WindowConfig::builder().max_pending_sequences(0),
        ];
        for builder in cases {
            assert!(matches!(builder.build(), Err(HandlerError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = WindowConfig::builder()
            .tumbling(60)
            .input_origins(origins(2))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: WindowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
