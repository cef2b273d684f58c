//! Connection lifecycle and safety-checked operations on one instrument.

use crate::dialect::{parse_timed_sweep_reply, probe_identity, DialectKind, SmuDialect};
use crate::error::SmuError;
use crate::safety::{validate_compliance, validate_voltage};
use crate::transport::{open_resource, ResourceManager, Terminators, Transport, BASELINE_TIMEOUT};
use crate::types::{ConnectionState, InstrumentIdentity, Measurement};
use log::{debug, info, warn};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Owns the transport to one SMU and every operation that touches it.
///
/// Operations other than [`connect`](Self::connect) and the accessors
/// require the session to be [`ConnectionState::Ready`]. Every
/// level-changing operation drains the instrument's error queue afterwards
/// and fails with [`SmuError::DeviceError`] if anything was queued.
pub struct InstrumentSession {
    manager: Box<dyn ResourceManager>,
    transport: Option<Box<dyn Transport>>,
    dialect: Option<Box<dyn SmuDialect>>,
    identity: Option<InstrumentIdentity>,
    state: ConnectionState,
    output_enabled: bool,
    last_resource: Option<String>,
    last_voltage: f64,
}

impl InstrumentSession {
    pub fn new(manager: impl ResourceManager + 'static) -> Self {
        Self {
            manager: Box::new(manager),
            transport: None,
            dialect: None,
            identity: None,
            state: ConnectionState::Disconnected,
            output_enabled: false,
            last_resource: None,
            last_voltage: 0.0,
        }
    }

    pub fn list_resources(&mut self) -> Result<Vec<String>, SmuError> {
        Ok(self.manager.list_resources()?)
    }

    /// Open `resource`, identify the instrument and put it into a known-safe
    /// state. A previous connection is zeroed and released first.
    pub fn connect(&mut self, resource: &str) -> Result<&InstrumentIdentity, SmuError> {
        if self.transport.is_some() {
            info!(
                "Releasing {} before reconnect",
                self.last_resource.as_deref().unwrap_or("unknown")
            );
            self.zero_and_disable_output();
            self.release_transport();
        }

        info!("Connecting to resource: {resource}");
        self.state = ConnectionState::Connecting;

        let mut transport = match open_resource(self.manager.as_mut(), resource) {
            Ok(t) => t,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        match Self::configure(transport.as_mut()) {
            Ok((identity, dialect)) => {
                info!(
                    "Connected to {} using {} dialect",
                    transport.resource_name(),
                    identity.dialect
                );
                self.last_resource = Some(transport.resource_name().to_string());
                self.transport = Some(transport);
                self.dialect = Some(dialect);
                self.output_enabled = false;
                self.last_voltage = 0.0;
                self.state = ConnectionState::Ready;
                Ok(self.identity.insert(identity))
            }
            Err(e) => {
                warn!("Connection setup failed for resource {resource}: {e}");
                if let Err(close_err) = transport.close() {
                    warn!("Failed to close instrument session: {close_err}");
                }
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn configure(
        transport: &mut dyn Transport,
    ) -> Result<(InstrumentIdentity, Box<dyn SmuDialect>), SmuError> {
        transport.set_terminators(Terminators::default());
        transport.set_timeout(BASELINE_TIMEOUT)?;

        let identity = InstrumentIdentity::from_raw(probe_identity(transport));
        debug!("Identity: {}", identity.raw);
        if !identity.is_recognized() {
            return Err(SmuError::UnrecognizedInstrument(identity.raw));
        }

        let dialect = identity.dialect.adapter();
        dialect.reset_to_defaults(transport)?;
        let errors = dialect.drain_errors(transport)?;
        if !errors.is_empty() {
            return Err(SmuError::DeviceError(errors));
        }
        Ok((identity, dialect))
    }

    /// Ask the connected instrument to identify itself again.
    pub fn query_identity(&mut self) -> Result<String, SmuError> {
        let (t, d) = self.parts()?;
        d.identify(t)
    }

    pub fn set_voltage(&mut self, volts: f64) -> Result<(), SmuError> {
        validate_voltage(volts)?;
        self.enable_output()?;
        let (t, d) = self.parts()?;
        d.set_voltage(t, volts)?;
        self.check_errors()?;
        self.last_voltage = volts;
        debug!("Voltage set to {volts} V");
        Ok(())
    }

    pub fn set_compliance_microamps(&mut self, microamps: f64) -> Result<(), SmuError> {
        validate_compliance(microamps)?;
        let (t, d) = self.parts()?;
        d.set_compliance_microamps(t, microamps)?;
        self.check_errors()?;
        debug!("Compliance set to {microamps} uA");
        Ok(())
    }

    pub fn measure_current(&mut self) -> Result<f64, SmuError> {
        let (t, d) = self.parts()?;
        d.measure_current(t)
    }

    pub fn enable_output(&mut self) -> Result<(), SmuError> {
        let (t, d) = self.parts()?;
        d.enable_output(t)?;
        self.output_enabled = true;
        self.check_errors()
    }

    pub fn disable_output(&mut self) -> Result<(), SmuError> {
        let (t, d) = self.parts()?;
        d.disable_output(t)?;
        self.output_enabled = false;
        self.check_errors()
    }

    /// Drive the source to 0 V and switch the output off. Never fails;
    /// anything that goes wrong is logged.
    pub fn zero_and_disable_output(&mut self) {
        if let Ok((t, d)) = self.parts() {
            if let Err(e) = d.set_voltage(t, 0.0) {
                warn!("Failed to zero output: {e}");
            }
            if let Err(e) = d.disable_output(t) {
                warn!("Failed to disable output: {e}");
            }
            match d.drain_errors(t) {
                Ok(errors) if !errors.is_empty() => {
                    warn!("Instrument reported errors while zeroing output: {errors:?}")
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read error queue while zeroing output: {e}"),
            }
        }
        self.output_enabled = false;
        self.last_voltage = 0.0;
    }

    /// Zero the output, release the transport and the resource manager.
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.transport.is_some() {
            info!(
                "Closing connection for resource: {}",
                self.last_resource.as_deref().unwrap_or("unknown")
            );
            self.zero_and_disable_output();
            self.release_transport();
        }
        self.manager.close();
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!("Failed to close instrument session: {e}");
            }
        }
        self.dialect = None;
        self.identity = None;
        self.output_enabled = false;
        self.state = ConnectionState::Disconnected;
    }

    /// Replace the transport timeout set at connect time.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), SmuError> {
        let transport = self.transport.as_mut().ok_or(SmuError::NotConnected)?;
        transport.set_timeout(timeout)?;
        debug!("Timeout set to {} ms", timeout.as_millis());
        Ok(())
    }

    /// Temporarily raise the transport timeout to at least `at_least`.
    /// The previous value comes back when the guard drops.
    pub fn raise_timeout(&mut self, at_least: Duration) -> Result<TimeoutGuard<'_>, SmuError> {
        let transport = self.transport.as_mut().ok_or(SmuError::NotConnected)?;
        let original = transport.timeout();
        let raised = original.max(at_least);
        transport.set_timeout(raised)?;
        info!(
            "Timeout set to {} ms (original {} ms)",
            raised.as_millis(),
            original.as_millis()
        );
        Ok(TimeoutGuard {
            session: self,
            original,
        })
    }

    /// Run `voltages` as one instrument-resident loop and return the pairs it
    /// reports. Script dialect only. The caller is responsible for giving the
    /// transport enough timeout for the whole loop.
    pub fn run_timed_sweep(
        &mut self,
        voltages: &[f64],
        delay: Duration,
    ) -> Result<Vec<Measurement>, SmuError> {
        match self.dialect_kind() {
            None => return Err(SmuError::NotConnected),
            Some(DialectKind::Line) => return Err(SmuError::FastModeUnavailable),
            Some(DialectKind::Script) => {}
        }
        if voltages.is_empty() {
            return Ok(Vec::new());
        }
        for &v in voltages {
            validate_voltage(v)?;
        }

        self.enable_output()?;
        let (t, d) = self.parts()?;
        let script = d
            .timed_sweep_script(voltages, delay)
            .ok_or(SmuError::FastModeUnavailable)?;
        debug!("Dispatching timed loop over {} points", voltages.len());
        let raw = t.query(&script)?;
        let results = parse_timed_sweep_reply(&raw);
        if results.is_empty() {
            return Err(SmuError::EmptyFastSweepResult);
        }
        if let Some(last) = results.last() {
            self.last_voltage = last.voltage;
        }
        self.check_errors()?;
        Ok(results)
    }

    fn check_errors(&mut self) -> Result<(), SmuError> {
        let (t, d) = self.parts()?;
        let errors = d.drain_errors(t)?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SmuError::DeviceError(errors))
        }
    }

    fn parts(&mut self) -> Result<(&mut dyn Transport, &dyn SmuDialect), SmuError> {
        match (self.transport.as_deref_mut(), self.dialect.as_deref()) {
            (Some(t), Some(d)) => Ok((t, d)),
            _ => Err(SmuError::NotConnected),
        }
    }

    pub fn identity(&self) -> Option<&InstrumentIdentity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn dialect_kind(&self) -> Option<DialectKind> {
        self.dialect.as_ref().map(|d| d.kind())
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    pub fn last_resource(&self) -> Option<&str> {
        self.last_resource.as_deref()
    }

    /// Level most recently sourced through this session.
    pub fn last_voltage(&self) -> f64 {
        self.last_voltage
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.transport.as_ref().map(|t| t.timeout())
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Restores the transport timeout captured by
/// [`InstrumentSession::raise_timeout`] when dropped.
pub struct TimeoutGuard<'a> {
    session: &'a mut InstrumentSession,
    original: Duration,
}

impl Deref for TimeoutGuard<'_> {
    type Target = InstrumentSession;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for TimeoutGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        if let Some(transport) = self.session.transport.as_mut() {
            match transport.set_timeout(self.original) {
                Ok(()) => info!("Timeout restored to {} ms", self.original.as_millis()),
                Err(e) => warn!("Failed restoring timeout: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{SimModel, SimulatedBench, SimulatedSmu};

    fn bench_with(resource: &str, model: SimModel) -> (SimulatedBench, SimulatedSmu) {
        let bench = SimulatedBench::new();
        let smu = SimulatedSmu::new(model);
        bench.insert(resource, smu.clone());
        (bench, smu)
    }

    fn connected(model: SimModel) -> (InstrumentSession, SimulatedSmu) {
        let (bench, smu) = bench_with("GPIB0::24::INSTR", model);
        let mut session = InstrumentSession::new(bench);
        session.connect("GPIB0::24::INSTR").unwrap();
        (session, smu)
    }

    #[test]
    fn test_connect_applies_script_defaults() {
        let (session, smu) = connected(SimModel::Keithley2602);
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.dialect_kind(), Some(DialectKind::Script));
        assert_eq!(session.identity().unwrap().channel, "smua");
        assert!(!smu.output_enabled());
        assert_eq!(smu.source_level(), 0.0);
        assert_eq!(smu.compliance_amps(), 1e-6);
        assert!(smu.autorange());
        assert_eq!(smu.current_timeout(), BASELINE_TIMEOUT);
    }

    #[test]
    fn test_connect_falls_back_to_sibling_bus() {
        let (bench, _smu) = bench_with("GPIB1::24::INSTR", SimModel::Keithley2400);
        let mut session = InstrumentSession::new(bench);
        let identity = session.connect("GPIB0::24::INSTR").unwrap();
        assert_eq!(identity.dialect, DialectKind::Line);
        assert_eq!(session.last_resource(), Some("GPIB1::24::INSTR"));
    }

    #[test]
    fn test_identity_fallback_selects_script_dialect() {
        let bench = SimulatedBench::new();
        bench.insert(
            "USB0::1::INSTR",
            SimulatedSmu::new(SimModel::Keithley2602).fail_identity(),
        );
        let mut session = InstrumentSession::new(bench);
        let identity = session.connect("USB0::1::INSTR").unwrap();
        assert_eq!(identity.raw, "KEITHLEY,2602B,TSP");
        assert_eq!(identity.dialect, DialectKind::Script);
    }

    #[test]
    fn test_unrecognized_instrument_unwinds() {
        let bench = SimulatedBench::new();
        let smu = SimulatedSmu::new(SimModel::Keithley2400).with_identity("ACME,PSU-3000,1,1.0");
        bench.insert("GPIB0::5::INSTR", smu.clone());
        let mut session = InstrumentSession::new(bench);

        let err = session.connect("GPIB0::5::INSTR").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnrecognizedInstrument);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(smu.is_closed());
        assert!(matches!(session.measure_current(), Err(SmuError::NotConnected)));
    }

    #[test]
    fn test_missing_resource_leaves_session_disconnected() {
        let mut session = InstrumentSession::new(SimulatedBench::new());
        let err = session.connect("GPIB0::9::INSTR").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_set_voltage_enables_output_first() {
        let (mut session, smu) = connected(SimModel::Keithley2400);
        session.set_voltage(1.0).unwrap();
        assert!(smu.output_enabled());
        assert!(session.output_enabled());
        assert_eq!(smu.source_level(), 1.0);
        assert_eq!(session.last_voltage(), 1.0);

        let commands = smu.commands();
        let tail: Vec<&str> = commands.iter().rev().take(4).rev().map(|s| s.as_str()).collect();
        assert_eq!(tail, vec!["OUTP ON", "SYST:ERR?", "SOUR:VOLT 1", "SYST:ERR?"]);
    }

    #[test]
    fn test_out_of_range_voltage_never_reaches_transport() {
        let (mut session, smu) = connected(SimModel::Keithley2602);
        let before = smu.commands().len();
        let err = session.set_voltage(210.5).err().unwrap();
        assert!(err.is_validation());
        assert!(session.set_compliance_microamps(0.0).err().unwrap().is_validation());
        assert!(session.set_voltage(f64::NAN).is_err());
        assert_eq!(smu.commands().len(), before);
        assert!(session.is_ready());
    }

    #[test]
    fn test_device_error_surfaces_after_set() {
        let (mut session, smu) = connected(SimModel::Keithley2602);
        session.set_compliance_microamps(50.0).unwrap();
        assert_eq!(smu.compliance_amps(), 50e-6);

        smu.push_device_error(5007, "Operation would exceed safe operating area");
        let err = session.set_voltage(2.0).err().unwrap();
        match err {
            SmuError::DeviceError(records) => assert_eq!(records[0].code, 5007),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_measure_current_rejects_overrange() {
        let (mut session, smu) = connected(SimModel::Keithley2400);
        session.set_compliance_microamps(1000.0).unwrap();
        session.set_voltage(0.5).unwrap();
        let current = session.measure_current().unwrap();
        assert!((current - 0.5e-6).abs() < 1e-15);

        smu.force_overrange(true);
        assert!(matches!(
            session.measure_current(),
            Err(SmuError::OverrangeReading(_))
        ));
    }

    #[test]
    fn test_close_zeroes_output_and_is_idempotent() {
        let (bench, smu) = bench_with("GPIB0::24::INSTR", SimModel::Keithley2602);
        let mut session = InstrumentSession::new(bench.clone());
        session.connect("GPIB0::24::INSTR").unwrap();
        session.set_voltage(3.0).unwrap();

        session.close();
        assert!(!smu.output_enabled());
        assert_eq!(smu.source_level(), 0.0);
        assert!(smu.is_closed());
        assert!(bench.is_closed());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.identity().is_none());

        session.close();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_releases_previous_instrument() {
        let bench = SimulatedBench::new();
        let first = SimulatedSmu::new(SimModel::Keithley2400);
        let second = SimulatedSmu::new(SimModel::Keithley2602);
        bench.insert("GPIB0::1::INSTR", first.clone());
        bench.insert("GPIB0::2::INSTR", second.clone());
        let mut session = InstrumentSession::new(bench);

        session.connect("GPIB0::1::INSTR").unwrap();
        session.set_voltage(1.5).unwrap();
        session.connect("GPIB0::2::INSTR").unwrap();

        assert!(!first.output_enabled());
        assert_eq!(first.source_level(), 0.0);
        assert!(first.is_closed());
        assert_eq!(session.dialect_kind(), Some(DialectKind::Script));
    }

    #[test]
    fn test_serial_number_collision_keeps_line_dialect() {
        let bench = SimulatedBench::new();
        bench.insert(
            "GPIB0::24::INSTR",
            SimulatedSmu::new(SimModel::Keithley2400)
                .with_identity("KEITHLEY INSTRUMENTS INC.,MODEL 2400,4126112,C30"),
        );
        let mut session = InstrumentSession::new(bench);
        let identity = session.connect("GPIB0::24::INSTR").unwrap();
        assert_eq!(identity.dialect, DialectKind::Line);
        assert!(session.is_ready());
    }

    #[test]
    fn test_zero_and_disable_swallows_write_failure() {
        let (mut session, smu) = connected(SimModel::Keithley2400);
        session.set_voltage(2.0).unwrap();
        smu.fail_on("OUTP OFF");

        session.zero_and_disable_output();
        assert!(!session.output_enabled());
        assert_eq!(session.last_voltage(), 0.0);
        assert_eq!(smu.source_level(), 0.0);
        assert!(session.is_ready());
    }

    #[test]
    fn test_timeout_guard_restores_on_drop() {
        let (mut session, smu) = connected(SimModel::Keithley2602);
        {
            let guard = session.raise_timeout(Duration::from_secs(30)).unwrap();
            assert_eq!(guard.timeout(), Some(Duration::from_secs(30)));
        }
        assert_eq!(session.timeout(), Some(BASELINE_TIMEOUT));
        assert_eq!(smu.current_timeout(), BASELINE_TIMEOUT);

        // Never lowers an already larger timeout.
        let guard = session.raise_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(guard.timeout(), Some(BASELINE_TIMEOUT));
        drop(guard);

        session.set_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(smu.current_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_timed_sweep_requires_script_dialect() {
        let (mut session, _smu) = connected(SimModel::Keithley2400);
        assert!(matches!(
            session.run_timed_sweep(&[0.0, 1.0], Duration::from_millis(1)),
            Err(SmuError::FastModeUnavailable)
        ));
    }

    #[test]
    fn test_timed_sweep_returns_pairs() {
        let (mut session, smu) = connected(SimModel::Keithley2602);
        session.set_compliance_microamps(1000.0).unwrap();
        let results = session
            .run_timed_sweep(&[0.0, 0.5, 1.0], Duration::from_millis(1))
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].voltage, 0.5);
        assert!((results[2].current - 1e-6).abs() < 1e-15);

        smu.set_timed_sweep_reply(Some("garbage".to_string()));
        assert!(matches!(
            session.run_timed_sweep(&[0.0], Duration::from_millis(1)),
            Err(SmuError::EmptyFastSweepResult)
        ));
    }

    #[test]
    fn test_operations_require_connection() {
        let mut session = InstrumentSession::new(SimulatedBench::new());
        assert!(matches!(session.set_voltage(1.0), Err(SmuError::NotConnected)));
        assert!(matches!(session.enable_output(), Err(SmuError::NotConnected)));
        assert!(session.raise_timeout(Duration::from_secs(1)).is_err());
        session.zero_and_disable_output();
        session.close();
    }
}
