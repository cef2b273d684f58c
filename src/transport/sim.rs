//! In-process SMU simulator.
//!
//! Understands the command subset the dialect adapters emit and models the
//! device as a resistive load behind a current limit. Used for `--simulate`
//! runs and as the instrument double throughout the test suite.

use super::{ResourceManager, Terminators, Transport, BASELINE_TIMEOUT};
use crate::error::TransportError;
use log::{debug, trace};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Reading the simulator returns when forced overrange.
const SIM_OVERRANGE: f64 = 9.91e37;

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w+\.(source\.levelv|source\.limiti|source\.output|source\.func|measure\.autorangei)\s*=\s*(.+)$")
        .expect("valid assignment pattern")
});

static SCRIPT_POINTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"local pts=\{([^}]*)\}").expect("valid points pattern"));

static SCRIPT_DELAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"delay\(([^)]*)\)").expect("valid delay pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimModel {
    /// Line-command dialect.
    Keithley2400,
    /// Script dialect.
    Keithley2602,
}

impl SimModel {
    pub const ALL: [SimModel; 2] = [SimModel::Keithley2400, SimModel::Keithley2602];

    pub fn resource_name(self) -> String {
        match self {
            SimModel::Keithley2400 => "SIM::2400::INSTR".to_string(),
            SimModel::Keithley2602 => "SIM::2602::INSTR".to_string(),
        }
    }

    pub fn identity(self) -> &'static str {
        match self {
            SimModel::Keithley2400 => "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234567,C30",
            SimModel::Keithley2602 => "Keithley Instruments Inc., Model 2602B, 1234567, 3.2.2",
        }
    }

    fn model_number(self) -> &'static str {
        match self {
            SimModel::Keithley2400 => "2400",
            SimModel::Keithley2602 => "2602B",
        }
    }

    fn is_script(self) -> bool {
        matches!(self, SimModel::Keithley2602)
    }
}

#[derive(Debug)]
struct SimState {
    model: SimModel,
    identity: String,
    identity_fails: bool,
    output: bool,
    level: f64,
    limit: f64,
    autorange: bool,
    load_ohms: f64,
    overrange: bool,
    errors: VecDeque<(i64, String)>,
    fail_on: Vec<String>,
    timed_sweep_reply: Option<String>,
    pending: VecDeque<String>,
    timeout: Duration,
    timeout_history: Vec<Duration>,
    commands: Vec<String>,
    closed: bool,
}

/// Handle onto one simulated instrument. Clones share the same device, so a
/// test can keep one handle for inspection after boxing another as a
/// transport.
#[derive(Debug, Clone)]
pub struct SimulatedSmu {
    state: Arc<Mutex<SimState>>,
    resource: String,
}

impl SimulatedSmu {
    pub fn new(model: SimModel) -> Self {
        Self {
            resource: model.resource_name(),
            state: Arc::new(Mutex::new(SimState {
                model,
                identity: model.identity().to_string(),
                identity_fails: false,
                output: false,
                level: 0.0,
                limit: 1e-6,
                autorange: false,
                load_ohms: 1e6,
                overrange: false,
                errors: VecDeque::new(),
                fail_on: Vec::new(),
                timed_sweep_reply: None,
                pending: VecDeque::new(),
                timeout: BASELINE_TIMEOUT,
                timeout_history: Vec::new(),
                commands: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Build from a `SIM::<model>::INSTR` name.
    pub fn from_resource(resource: &str) -> Result<Self, TransportError> {
        let model = resource
            .split("::")
            .nth(1)
            .and_then(|m| match m {
                "2400" => Some(SimModel::Keithley2400),
                "2602" | "2602B" => Some(SimModel::Keithley2602),
                _ => None,
            })
            .ok_or_else(|| TransportError::Unsupported(resource.to_string()))?;
        let mut smu = Self::new(model);
        smu.resource = resource.to_string();
        Ok(smu)
    }

    pub fn with_identity(self, identity: &str) -> Self {
        self.state.lock().identity = identity.to_string();
        self
    }

    /// Leave `*IDN?` unanswered so the caller falls back to other probes.
    pub fn fail_identity(self) -> Self {
        self.state.lock().identity_fails = true;
        self
    }

    pub fn set_load_resistance(&self, ohms: f64) {
        self.state.lock().load_ohms = ohms;
    }

    pub fn force_overrange(&self, overrange: bool) {
        self.state.lock().overrange = overrange;
    }

    pub fn push_device_error(&self, code: i64, message: &str) {
        self.state.lock().errors.push_back((code, message.to_string()));
    }

    /// Make any write containing `fragment` fail with a broken pipe.
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().fail_on.push(fragment.to_string());
    }

    /// Replace the computed reply to the next instrument-timed loop.
    pub fn set_timed_sweep_reply(&self, reply: Option<String>) {
        self.state.lock().timed_sweep_reply = reply;
    }

    pub fn output_enabled(&self) -> bool {
        self.state.lock().output
    }

    pub fn source_level(&self) -> f64 {
        self.state.lock().level
    }

    pub fn compliance_amps(&self) -> f64 {
        self.state.lock().limit
    }

    pub fn autorange(&self) -> bool {
        self.state.lock().autorange
    }

    pub fn current_timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    /// Every timeout applied through [`Transport::set_timeout`], in order.
    pub fn timeout_history(&self) -> Vec<Duration> {
        self.state.lock().timeout_history.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl SimState {
    fn current(&self) -> f64 {
        if self.overrange {
            return SIM_OVERRANGE;
        }
        if !self.output {
            return 0.0;
        }
        let raw = self.level / self.load_ohms;
        raw.clamp(-self.limit, self.limit)
    }

    fn current_at(&self, level: f64) -> f64 {
        if self.overrange {
            return SIM_OVERRANGE;
        }
        (level / self.load_ohms).clamp(-self.limit, self.limit)
    }

    fn reply(&mut self, line: String) {
        self.pending.push_back(line);
    }

    fn error(&mut self, code: i64, message: &str) {
        self.errors.push_back((code, message.to_string()));
    }

    fn handle(&mut self, command: &str) {
        let command = command.trim();
        if command == "*IDN?" {
            if !self.identity_fails {
                let identity = self.identity.clone();
                self.reply(identity);
            }
            return;
        }
        if self.model.is_script() {
            self.handle_script(command);
        } else {
            self.handle_line(command);
        }
    }

    fn handle_line(&mut self, command: &str) {
        let upper = command.to_ascii_uppercase();
        let (header, argument) = match upper.split_once(' ') {
            Some((h, a)) => (h, a.trim()),
            None => (upper.as_str(), ""),
        };
        match header {
            "*CLS" => self.errors.clear(),
            "OUTP" => match argument {
                "ON" | "1" => self.output = true,
                "OFF" | "0" => self.output = false,
                _ => self.error(-224, "Illegal parameter value"),
            },
            "SOUR:VOLT" => match argument.parse::<f64>() {
                Ok(v) => self.level = v,
                Err(_) => self.error(-104, "Data type error"),
            },
            "SENS:CURR:PROT" => match argument.parse::<f64>() {
                Ok(a) => self.limit = a.abs(),
                Err(_) => self.error(-104, "Data type error"),
            },
            "SENS:CURR:RANG:AUTO" => self.autorange = argument == "ON",
            "MEAS:CURR?" => {
                let current = self.current();
                self.reply(format!("{current:+.6E}"));
            }
            "SYST:ERR?" => {
                let line = match self.errors.pop_front() {
                    Some((code, msg)) => format!("{code},\"{msg}\""),
                    None => "0,\"No error\"".to_string(),
                };
                self.reply(line);
            }
            _ => self.error(-113, "Undefined header"),
        }
    }

    fn handle_script(&mut self, command: &str) {
        if command.starts_with("local pts=") {
            self.run_timed_loop(command);
            return;
        }
        if command == "print(localnode.model)" {
            let model = self.model.model_number().to_string();
            self.reply(model);
            return;
        }
        if command.ends_with(".reset()") {
            self.output = false;
            self.level = 0.0;
            self.limit = 1e-4;
            self.autorange = true;
            return;
        }
        if command.starts_with("print(") && command.contains(".measure.i()") {
            let current = self.current();
            self.reply(format!("{current:.12e}"));
            return;
        }
        if command == "print(errorqueue.count)" {
            let count = self.errors.len() as f64;
            self.reply(format!("{count:.5e}"));
            return;
        }
        if command.contains("errorqueue.next()") {
            let line = match self.errors.pop_front() {
                Some((code, msg)) => format!("{code}|{msg}|2|1"),
                None => "0|Queue Is Empty|0|0".to_string(),
            };
            self.reply(line);
            return;
        }
        if let Some(caps) = ASSIGNMENT.captures(command) {
            let value = caps[2].trim().to_string();
            match &caps[1] {
                "source.levelv" => match value.parse::<f64>() {
                    Ok(v) => self.level = v,
                    Err(_) => self.error(-285, "Program syntax error"),
                },
                "source.limiti" => match value.parse::<f64>() {
                    Ok(a) => self.limit = a.abs(),
                    Err(_) => self.error(-285, "Program syntax error"),
                },
                "source.output" => self.output = value.ends_with("OUTPUT_ON"),
                "measure.autorangei" => self.autorange = value.ends_with("AUTORANGE_ON"),
                _ => {}
            }
            return;
        }
        self.error(-285, "Program syntax error");
    }

    fn run_timed_loop(&mut self, script: &str) {
        let points: Vec<f64> = SCRIPT_POINTS
            .captures(script)
            .map(|c| {
                c[1].split(',')
                    .filter_map(|p| p.trim().parse::<f64>().ok())
                    .collect()
            })
            .unwrap_or_default();
        let delay = SCRIPT_DELAY
            .captures(script)
            .and_then(|c| c[1].trim().parse::<f64>().ok())
            .unwrap_or(0.0);

        let loop_duration = points.len() as f64 * delay;
        if loop_duration > self.timeout.as_secs_f64() {
            debug!(
                "Simulated loop of {loop_duration:.3} s outlasts {:?} timeout",
                self.timeout
            );
            return;
        }

        if let Some(reply) = self.timed_sweep_reply.take() {
            self.reply(reply);
            return;
        }

        let mut out = String::new();
        for &v in &points {
            self.level = v;
            let i = self.current_at(v);
            out.push_str(&format!("{v},{i:.12e};"));
        }
        self.reply(out);
    }
}

impl Transport for SimulatedSmu {
    fn resource_name(&self) -> &str {
        &self.resource
    }

    fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.commands.push(command.to_string());
        if state.fail_on.iter().any(|f| command.contains(f.as_str())) {
            return Err(TransportError::Io {
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulated write failure"),
                context: "writing command".to_string(),
            });
        }
        trace!("sim <- {command}");
        state.handle(command);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match state.pending.pop_front() {
            Some(line) => {
                trace!("sim -> {line}");
                Ok(line)
            }
            None => Err(TransportError::Timeout(state.timeout.as_millis())),
        }
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.timeout = timeout;
        state.timeout_history.push(timeout);
        Ok(())
    }

    fn set_terminators(&mut self, _terminators: Terminators) {}

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BenchState {
    devices: HashMap<String, SimulatedSmu>,
    denied: HashMap<String, String>,
    attempts: Vec<String>,
    closed: bool,
}

/// A [`ResourceManager`] over a fixed set of simulated instruments keyed by
/// arbitrary resource names. Unknown names report "not present".
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: &str, smu: SimulatedSmu) {
        self.state.lock().devices.insert(resource.to_string(), smu);
    }

    /// Fail opens of `resource` with a non-fallback error.
    pub fn deny(&self, resource: &str, message: &str) {
        self.state
            .lock()
            .denied
            .insert(resource.to_string(), message.to_string());
    }

    pub fn open_attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl ResourceManager for SimulatedBench {
    fn open(&mut self, resource: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock();
        state.attempts.push(resource.to_string());
        state.closed = false;
        if let Some(message) = state.denied.get(resource) {
            return Err(TransportError::Open {
                resource: resource.to_string(),
                message: message.clone(),
            });
        }
        match state.devices.get(resource) {
            Some(smu) => {
                let mut smu = smu.clone();
                smu.resource = resource.to_string();
                smu.state.lock().closed = false;
                Ok(Box::new(smu))
            }
            None => Err(TransportError::NotPresent {
                resource: resource.to_string(),
                message: "Insufficient location information or the requested device is not present in the system".to_string(),
            }),
        }
    }

    fn list_resources(&mut self) -> Result<Vec<String>, TransportError> {
        let mut names: Vec<String> = self.state.lock().devices.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}
