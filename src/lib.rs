pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod logger;
pub mod safety;
pub mod session;
pub mod sink;
pub mod transport;
pub mod types;
pub mod waveform;

pub use config::{load_config, load_config_or_default, AppConfig};
pub use dialect::{DialectKind, LineDialect, ScriptDialect, SmuDialect};
pub use error::{DeviceErrorRecord, ErrorKind, SmuError, TransportError};
pub use executor::{
    fast_sweep_timeout, CancelToken, ExecutionMode, LiveSample, LiveSampler, SweepExecutor,
    SweepObserver, SweepOutcome, SweepPlan, SweepProgress, SweepReport, SweepState,
};
pub use logger::RecordLogger;
pub use safety::{
    exceeds_advisory, validate_compliance, validate_delay, validate_voltage, FastLimit,
    SafetyLimits, HIGH_VOLTAGE_ADVISORY, SAFETY_LIMITS,
};
pub use session::{InstrumentSession, TimeoutGuard};
pub use sink::{ChannelObserver, JsonlRecorder, MeasurementRecord, SweepEvent};
pub use transport::{
    open_resource, DefaultResourceManager, ResourceManager, SimModel, SimulatedBench,
    SimulatedSmu, Transport,
};
pub use types::{ConnectionState, InstrumentIdentity, Measurement};
pub use waveform::{SweepPoint, SweepPreset, WrerParams};
