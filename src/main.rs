use std::cell::Cell;
use std::env;
use std::process;
use std::rc::Rc;

use lockstep::interrupts::irq_line_hold;
use lockstep::memory::write_handler;
use lockstep::{
    AddressSpaceConfig, ConfigError, CpuConfig, CpuCore, InputLine, LineState, Machine, MachineBus, MachineConfig,
    Mapping, SpaceKind, WatchdogConfig,
};

const SOUND_LATCH: u32 = 0x6000;

/// Runs NOPs from ROM and posts a sound command every 256 instructions.
/// Kicks the watchdog from its VBLANK interrupt.
struct MainCore {
    pc: u32,
    count: u32,
    irq: bool,
    irqs: Rc<Cell<u64>>,
}

impl CpuCore for MainCore {
    fn execute(&mut self, cycles: i32, bus: &mut MachineBus<'_>) -> i32 {
        while bus.remaining_cycles() > 0 {
            if self.irq {
                self.irq = false;
                self.irqs.set(self.irqs.get() + 1);
                bus.watchdog_kick();
            }
            bus.debug_hook(self.pc);
            let _opcode = bus.read_opcode_byte(self.pc);
            self.pc = (self.pc + 1) & 0x7fff;
            self.count = self.count.wrapping_add(1);
            if self.count % 256 == 0 {
                bus.write_byte(SpaceKind::Program, SOUND_LATCH, (self.count >> 8) as u8);
            }
            bus.consume_cycles(4);
        }
        cycles - bus.remaining_cycles()
    }

    fn reset(&mut self, _param: i32) {
        self.pc = 0;
        self.irq = false;
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_input_line(&mut self, line: InputLine, state: LineState) {
        if line == InputLine::Irq(0) && state.is_active() {
            self.irq = true;
        }
    }

    fn save_state(&self) -> Vec<u8> {
        [self.pc.to_le_bytes(), self.count.to_le_bytes()].concat()
    }

    fn load_state(&mut self, data: &[u8]) {
        if let (Some(pc), Some(count)) = (data.get(0..4), data.get(4..8)) {
            self.pc = u32::from_le_bytes([pc[0], pc[1], pc[2], pc[3]]);
            self.count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]);
        }
    }
}

/// Sleeps until interrupted, then takes the command and sleeps again.
struct SoundCore {
    pending: bool,
    commands: Rc<Cell<u64>>,
}

impl CpuCore for SoundCore {
    fn execute(&mut self, cycles: i32, bus: &mut MachineBus<'_>) -> i32 {
        if self.pending {
            self.pending = false;
            self.commands.set(self.commands.get() + 1);
            bus.consume_cycles(20);
        }
        bus.spin_until_interrupt();
        cycles - bus.remaining_cycles()
    }

    fn reset(&mut self, _param: i32) {
        self.pending = false;
    }

    fn pc(&self) -> u32 {
        0
    }

    fn set_input_line(&mut self, line: InputLine, state: LineState) {
        if line == InputLine::Irq(0) && state.is_active() {
            self.pending = true;
        }
    }
}

fn build(watchdog: Option<u32>, irqs: Rc<Cell<u64>>, commands: Rc<Cell<u64>>) -> Result<Machine, ConfigError> {
    let config = MachineConfig {
        cpus: vec![
            CpuConfig::new("main", 4_000_000).with_vblank_interrupt(1, irq_line_hold(0)),
            CpuConfig::new("sound", 2_000_000).with_space(AddressSpaceConfig::new(SpaceKind::Program, 12, 8)),
        ],
        slices_per_frame: 4,
        watchdog: watchdog.map_or(WatchdogConfig::Disabled, WatchdogConfig::Vblank),
        ..Default::default()
    };
    let cores: Vec<Box<dyn CpuCore>> = vec![
        Box::new(MainCore { pc: 0, count: 0, irq: false, irqs }),
        Box::new(SoundCore { pending: false, commands }),
    ];
    let mut machine = Machine::new(config, cores)?;

    let memory = machine.memory_mut();
    memory.add_rom("main", vec![0; 0x8000])?;
    memory.set_base_region(0, SpaceKind::Program, "main")?;
    memory.install_rom(0, SpaceKind::Program, Mapping::new(0x0000, 0x5fff))?;
    memory.install_ram(0, SpaceKind::Program, Mapping::new(0x7000, 0x77ff))?;
    memory.install_write_handler(
        0,
        SpaceKind::Program,
        Mapping::new(SOUND_LATCH, SOUND_LATCH),
        "soundlatch",
        8,
        write_handler(|bus: &mut MachineBus<'_>, _, _, _| bus.set_input_line(1, InputLine::Irq(0), LineState::Hold)),
    )?;
    machine.reset();
    Ok(machine)
}

fn main() {
    #[cfg(not(target_arch = "wasm32"))]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let mut frames = 60u64;
    let mut watchdog = None;
    let mut snapshot = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" => {
                i += 1;
                frames = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => n,
                    None => usage(&args[0]),
                };
            }
            "--watchdog" => {
                i += 1;
                watchdog = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => Some(n),
                    None => usage(&args[0]),
                };
            }
            "--snapshot" => snapshot = true,
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                usage(&args[0]);
            }
        }
        i += 1;
    }

    let irqs = Rc::new(Cell::new(0));
    let commands = Rc::new(Cell::new(0));
    let mut machine = match build(watchdog, irqs.clone(), commands.clone()) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };

    let mut saved = None;
    for frame in 0..frames {
        if snapshot && frame == frames / 2 {
            match machine.snapshot() {
                Ok(bytes) => saved = Some(bytes),
                Err(err) => eprintln!("snapshot failed: {err}"),
            }
        }
        machine.run_frame();
        if machine.exit_requested() {
            break;
        }
    }

    println!("time:        {}", machine.now());
    println!("frames:      {}", machine.interrupts().current_frame());
    for cpu in 0..machine.cpu_count() {
        println!("cpu #{cpu}:      {} cycles", machine.scheduler().total_cycles(cpu));
    }
    println!("vblank irqs: {}", irqs.get());
    println!("commands:    {}", commands.get());

    if let Some(bytes) = saved {
        let end = machine.scheduler().total_cycles(0);
        match machine.restore(&bytes) {
            Ok(()) => println!(
                "snapshot:    {} bytes, restored to {} cycles (was {end})",
                bytes.len(),
                machine.scheduler().total_cycles(0)
            ),
            Err(err) => {
                eprintln!("restore failed: {err}");
                process::exit(1);
            }
        }
    }
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} [--frames <n>] [--watchdog <vblanks>] [--snapshot]");
    process::exit(1);
}
