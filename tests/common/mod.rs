#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lockstep::{CpuConfig, CpuCore, InputLine, LineState, Machine, MachineBus, MachineConfig};

/// Per-execute hook of a [`ScriptCore`].
pub type Script = Box<dyn FnMut(&mut MachineBus<'_>, i32)>;

/// Shared view of what a scripted core saw.
#[derive(Clone, Default)]
pub struct Recorder {
    pub budgets: Rc<RefCell<Vec<i32>>>,
    pub resets: Rc<Cell<u32>>,
    pub lines: Rc<RefCell<Vec<(InputLine, LineState)>>>,
}

/// Core that runs a script once per `execute`, then burns whatever budget
/// is left.
pub struct ScriptCore {
    pub recorder: Recorder,
    script: Option<Script>,
    pc: u32,
}

impl ScriptCore {
    pub fn new(recorder: Recorder) -> Self {
        ScriptCore { recorder, script: None, pc: 0 }
    }

    pub fn with_script(recorder: Recorder, script: Script) -> Self {
        ScriptCore { recorder, script: Some(script), pc: 0 }
    }
}

impl CpuCore for ScriptCore {
    fn execute(&mut self, cycles: i32, bus: &mut MachineBus<'_>) -> i32 {
        self.recorder.budgets.borrow_mut().push(cycles);
        if let Some(script) = self.script.as_mut() {
            script(bus, cycles);
        }
        let left = bus.remaining_cycles();
        bus.consume_cycles(left);
        self.pc = self.pc.wrapping_add(1);
        cycles - bus.remaining_cycles()
    }

    fn reset(&mut self, _param: i32) {
        self.recorder.resets.set(self.recorder.resets.get() + 1);
        self.pc = 0;
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_input_line(&mut self, line: InputLine, state: LineState) {
        self.recorder.lines.borrow_mut().push((line, state));
    }

    fn save_state(&self) -> Vec<u8> {
        self.pc.to_le_bytes().to_vec()
    }

    fn load_state(&mut self, data: &[u8]) {
        if let Ok(bytes) = <[u8; 4]>::try_from(data) {
            self.pc = u32::from_le_bytes(bytes);
        }
    }
}

pub fn config(clocks: &[u64]) -> MachineConfig {
    MachineConfig {
        cpus: clocks
            .iter()
            .enumerate()
            .map(|(n, &hz)| CpuConfig::new(&format!("cpu{n}"), hz))
            .collect(),
        ..Default::default()
    }
}

/// Machine whose cores just burn their budgets.
pub fn burners(config: MachineConfig) -> (Machine, Vec<Recorder>) {
    let recorders: Vec<Recorder> = config.cpus.iter().map(|_| Recorder::default()).collect();
    let cores = recorders
        .iter()
        .map(|recorder| Box::new(ScriptCore::new(recorder.clone())) as Box<dyn CpuCore>)
        .collect();
    (Machine::new(config, cores).unwrap(), recorders)
}

/// Machine with one script per CPU.
pub fn scripted(config: MachineConfig, scripts: Vec<Option<Script>>) -> (Machine, Vec<Recorder>) {
    let recorders: Vec<Recorder> = config.cpus.iter().map(|_| Recorder::default()).collect();
    let cores = recorders
        .iter()
        .zip(scripts)
        .map(|(recorder, script)| {
            let core = match script {
                Some(script) => ScriptCore::with_script(recorder.clone(), script),
                None => ScriptCore::new(recorder.clone()),
            };
            Box::new(core) as Box<dyn CpuCore>
        })
        .collect();
    (Machine::new(config, cores).unwrap(), recorders)
}
