use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::{env, process::exit};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use websynth::wav::WavWriter;
use websynth::{Session, Settings, SettingsBuilder, Synth};

struct Opts {
    /// The synthesizer library.
    library: PathBuf,

    /// The synthesizer data file.
    data: PathBuf,

    /// WAV output path; raw samples go to stdout when unset.
    output: Option<PathBuf>,

    settings: Settings,

    /// Number of blocks to render.
    calls: u32,

    /// Short MIDI messages sent before rendering.
    messages: Vec<u32>,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let opts = parse_opts(&args);

    if let Err(err) = run(&opts) {
        error!("{}", err);
        exit(1);
    }
}

fn usage(program: &str) -> ! {
    eprintln!(
        "usage: {program} [-b LIB] [-w DATA] (-o OUT.wav | -s) [-f 22050|44100] [-p POLY] [-m VOL]\n\
         \x20      [-r 0|1] [-c 0|1] [-l LOAD] [-aRevAdj N] [-aChoAdj N] [-aOutLev N]\n\
         \x20      [-aRevFb N] [-aRevDrm N] [-aResoUpAdj N] [-n CALLS] [-e HEXMSG]..."
    );
    exit(1);
}

fn run(opts: &Opts) -> websynth::Result<()> {
    let synth = Synth::load(&opts.library)?;
    let mut session = Session::start(&synth, opts.settings, &opts.data)?;

    for &message in &opts.messages {
        session.short_message(message)?;
    }

    match &opts.output {
        Some(path) => {
            let file = BufWriter::new(File::create(path)?);
            let mut wav = WavWriter::new(file, session.sampling_freq())?;
            for _ in 0..opts.calls {
                wav.write_samples(session.render()?)?;
            }
            wav.finish()?;
        }
        None => {
            let mut out = io::stdout().lock();
            for _ in 0..opts.calls {
                let samples = session.render()?;
                let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                out.write_all(&bytes)?;
            }
            out.flush()?;
        }
    }
    Ok(())
}

/// Apply a validated setter, keeping the previous value on rejection.
fn set(
    builder: &mut SettingsBuilder,
    value: Option<&String>,
    setter: fn(&mut SettingsBuilder, u32) -> websynth::Result<&mut SettingsBuilder>,
) {
    let Some(value) = value else { return };
    match value.parse::<u32>() {
        Ok(n) => {
            if let Err(err) = setter(builder, n) {
                warn!("{}, keeping default", err);
            }
        }
        Err(_) => warn!("invalid number {:?}, keeping default", value),
    }
}

fn set_switch(value: Option<&String>, apply: impl FnOnce(bool)) {
    match value.map(|v| v.as_str()) {
        Some("0") => apply(false),
        Some("1") => apply(true),
        Some(other) => warn!("invalid switch {:?}, keeping default", other),
        None => {}
    }
}

fn parse_opts(args: &[String]) -> Opts {
    let program = args.first().map(String::as_str).unwrap_or("websynth");
    let mut library = PathBuf::from("d77_lib.so");
    let mut data = PathBuf::from("dswebWDM.dat");
    let mut output = None;
    let mut to_stdout = false;
    let mut calls = 100;
    let mut messages = Vec::new();
    let mut builder = Settings::builder();

    let mut i = 1; // Skip program name
    while i < args.len() {
        let value = args.get(i + 1);
        let mut consumed = true;
        match args[i].as_str() {
            "-b" => library = value.map(PathBuf::from).unwrap_or(library),
            "-w" => data = value.map(PathBuf::from).unwrap_or(data),
            "-o" => output = value.map(PathBuf::from),
            "-s" => {
                to_stdout = true;
                consumed = false;
            }
            "-f" => set(&mut builder, value, SettingsBuilder::sampling_freq),
            "-p" => set(&mut builder, value, SettingsBuilder::polyphony),
            "-m" => set(&mut builder, value, SettingsBuilder::master_volume),
            "-l" => set(&mut builder, value, SettingsBuilder::cpu_load_low),
            "-r" => set_switch(value, |on| {
                builder.reverb(on);
            }),
            "-c" => set_switch(value, |on| {
                builder.chorus(on);
            }),
            "-aRevAdj" => set(&mut builder, value, SettingsBuilder::reverb_adjust),
            "-aChoAdj" => set(&mut builder, value, SettingsBuilder::chorus_adjust),
            "-aOutLev" => set(&mut builder, value, SettingsBuilder::output_level),
            "-aRevFb" => set(&mut builder, value, SettingsBuilder::reverb_feedback),
            "-aRevDrm" => set(&mut builder, value, SettingsBuilder::reverb_drum),
            "-aResoUpAdj" => set(&mut builder, value, SettingsBuilder::reso_up_adjust),
            "-n" => match value.map(|v| v.parse::<u32>()) {
                Some(Ok(n)) => calls = n,
                _ => warn!("invalid call count, keeping {}", calls),
            },
            "-e" => match value.map(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16)) {
                Some(Ok(message)) => messages.push(message),
                _ => warn!("invalid MIDI message {:?}", value),
            },
            "-h" | "--help" => usage(program),
            other => {
                warn!("unknown option {:?}", other);
                consumed = false;
            }
        }
        i += if consumed { 2 } else { 1 };
    }

    if output.is_none() && !to_stdout {
        usage(program);
    }
    Opts {
        library,
        data,
        output: if to_stdout { None } else { output },
        settings: builder.build(),
        calls,
        messages,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
}
