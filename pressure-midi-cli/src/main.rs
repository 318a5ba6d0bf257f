mod clock;
mod device;
mod monitor;
mod verify;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pressure_midi_core::descriptors;
use pressure_midi_core::usb::DescriptorType;

#[derive(Parser)]
#[command(name = "pressure-midi-cli")]
#[command(about = "Companion tool for the pressure-sensitive MIDI key")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected keys
    Detect,
    /// Check the key's descriptors against the ones this tool was built with
    Descriptors {
        /// Dump the descriptors as read
        #[arg(long)]
        dump: bool,
    },
    /// Print MIDI events sent by the key
    Monitor {
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send MIDI clock so the key blinks on the beat
    Clock {
        /// Tempo in beats per minute
        #[arg(long, default_value_t = 120)]
        bpm: u32,
        /// Number of beats to send
        #[arg(long, default_value_t = 8)]
        beats: u32,
    },
}

fn check_descriptors(dump: bool) -> Result<()> {
    let handle = device::open_device()?;
    let tables = [
        ("device", DescriptorType::Device, 0),
        ("configuration", DescriptorType::Configuration, 0),
        ("languages", DescriptorType::String, 0),
        ("manufacturer", DescriptorType::String, descriptors::STRING_MANUFACTURER),
        ("product", DescriptorType::String, descriptors::STRING_PRODUCT),
    ];

    let mut failures = 0;
    for (name, kind, index) in tables {
        let Some(expected) = descriptors::lookup(kind, index) else {
            continue;
        };
        let expected: Vec<u8> = expected.iter().collect();
        let actual = device::read_descriptor(&handle, kind, index)?;
        match verify::first_difference(&expected, &actual) {
            None => println!("{:<14} ok ({} bytes)", name, actual.len()),
            Some(mismatch) => {
                failures += 1;
                println!("{:<14} MISMATCH: {}", name, mismatch);
            }
        }
        if dump {
            println!("{}", verify::hex_dump(&actual));
        }
    }

    if failures > 0 {
        bail!("{} descriptor(s) differ from the firmware tables", failures);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Detect => {
            let found = device::detect()?;
            if found.is_empty() {
                println!("No pressure key detected.");
                println!("Plug it in and wait for the red LED to blink once.");
            }
            for key in found {
                println!(
                    "Pressure key on bus {:03} address {:03} (release {}.{}{})",
                    key.bus,
                    key.address,
                    key.version.major(),
                    key.version.minor(),
                    key.version.sub_minor()
                );
            }
        }
        Command::Descriptors { dump } => check_descriptors(dump)?,
        Command::Monitor { count } => {
            let mut handle = device::open_device()?;
            device::claim_streaming(&mut handle)?;
            println!("Listening, press the key. Ctrl-C to quit.");
            monitor::run(&handle, count)?;
        }
        Command::Clock { bpm, beats } => {
            let mut handle = device::open_device()?;
            device::claim_streaming(&mut handle)?;
            clock::run(&handle, bpm, beats)?;
        }
    }

    Ok(())
}
