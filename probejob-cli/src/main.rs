//! `probejob` - run debug probe jobs from the command line.
//!
//! Every subcommand becomes one or more jobs that go through the dispatcher,
//! so the same locking and reset rules apply as for library users. Results
//! are printed as JSON on stdout, failures as JSON on stderr with the job's
//! errno as exit status.

mod output;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use probejob_core::{
    Coprocessor, Dispatcher, DispatcherConfig, Driver, EraseMode, FirmwareImage, InputFormat, Job, JobError,
    JobResponse, MockDriver, ProbeHandle, ProgramOptions, ReadOptions, RttConnection, UartDfu,
};
use serde::Deserialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

/// Control block location used by the simulated target.
const MOCK_RTT_CONTROL_BLOCK: u32 = 0x2000_0400;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run against a simulated probe (no hardware required)
    #[arg(long)]
    mock: bool,

    /// Serial number of the probe to use
    #[arg(short, long)]
    serial: Option<String>,

    /// Index of the probe to use, in enumeration order
    #[arg(long, conflicts_with = "serial")]
    probe_index: Option<usize>,

    /// Core the operation addresses
    #[arg(long, value_enum, default_value_t = CoreArg::Application)]
    core: CoreArg,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// How long a job waits for exclusive probe access
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version of the probe library
    Version,
    /// Build details of the probe library
    LibraryInfo,
    /// List connected probes
    Probes,
    /// List serial numbers of connected probes
    Serials,
    /// Information about the attached device
    DeviceInfo,
    /// Information about the probe itself
    ProbeInfo,
    /// Device version string
    DeviceVersion,
    /// Read memory
    Read {
        #[arg(value_parser = parse_hex)]
        address: u32,
        length: u32,
    },
    /// Read one aligned word
    ReadU32 {
        #[arg(value_parser = parse_hex)]
        address: u32,
    },
    /// Write memory
    Write {
        #[arg(value_parser = parse_hex)]
        address: u32,
        /// Hex string (e.g. "DEADBEEF")
        data: String,
    },
    /// Write one aligned word
    WriteU32 {
        #[arg(value_parser = parse_hex)]
        address: u32,
        #[arg(value_parser = parse_hex)]
        value: u32,
    },
    /// Program a firmware file
    Program {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,
        /// Load address of raw binaries
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        base_address: u32,
        #[arg(long, value_enum, default_value_t = EraseArg::All)]
        chip_erase: EraseArg,
        #[arg(long, value_enum, default_value_t = EraseArg::None)]
        qspi_erase: EraseArg,
        #[arg(long)]
        no_verify: bool,
    },
    /// Program through the USB DFU bootloader
    Dfu { file: PathBuf },
    /// Program through MCUboot serial recovery
    McubootDfu {
        file: PathBuf,
        #[command(flatten)]
        uart: UartArgs,
    },
    /// Update modem firmware over a UART
    ModemDfu {
        file: PathBuf,
        #[command(flatten)]
        uart: UartArgs,
    },
    /// Compare a firmware file against device memory
    Verify { file: PathBuf },
    /// Dump memory areas to a file
    ReadToFile {
        file: PathBuf,
        #[arg(long)]
        ram: bool,
        #[arg(long)]
        code: bool,
        #[arg(long)]
        uicr: bool,
        #[arg(long)]
        qspi: bool,
    },
    /// Erase flash
    Erase {
        #[arg(value_enum)]
        mode: EraseArg,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        start: u32,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        end: u32,
    },
    /// Erase everything and lift readback protection
    Recover,
    /// Reset the target CPU
    Reset,
    /// Keep the probe connection open
    Open,
    /// Close a connection opened with `open`
    Close,
    /// Start RTT, print what the target sends, then stop
    Rtt {
        /// Control block address. Target RAM is scanned when omitted.
        #[arg(long, value_parser = parse_hex)]
        address: Option<u32>,
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Text written to the down channel once RTT is running
        #[arg(long)]
        send: Option<String>,
        /// How long to keep reading
        #[arg(long, default_value_t = 1000)]
        duration_ms: u64,
        #[arg(long, default_value_t = 0)]
        clock_speed_khz: u32,
    },
}

#[derive(clap::Args)]
struct UartArgs {
    /// Serial port, e.g. /dev/ttyACM0
    #[arg(long)]
    uart: String,
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,
    #[arg(long, default_value_t = 5000)]
    response_timeout_ms: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum CoreArg {
    Application,
    Network,
    Modem,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Auto,
    Hex,
    Elf,
    Bin,
}

#[derive(Clone, Copy, ValueEnum)]
enum EraseArg {
    None,
    All,
    Pages,
    PagesIncludingUicr,
}

impl From<CoreArg> for Coprocessor {
    fn from(core: CoreArg) -> Self {
        match core {
            CoreArg::Application => Self::Application,
            CoreArg::Network => Self::Network,
            CoreArg::Modem => Self::Modem,
        }
    }
}

impl From<EraseArg> for EraseMode {
    fn from(mode: EraseArg) -> Self {
        match mode {
            EraseArg::None => Self::None,
            EraseArg::All => Self::All,
            EraseArg::Pages => Self::Pages,
            EraseArg::PagesIncludingUicr => Self::PagesIncludingUicr,
        }
    }
}

impl FormatArg {
    fn resolve(self, file: &Path) -> Self {
        if self != Self::Auto {
            return self;
        }
        match file.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("hex" | "ihex") => Self::Hex,
            Some("bin") => Self::Bin,
            _ => Self::Elf,
        }
    }
}

impl UartArgs {
    fn into_request(self, filename: PathBuf) -> UartDfu {
        UartDfu {
            filename,
            uart: self.uart,
            baud_rate: self.baud_rate,
            response_timeout_ms: self.response_timeout_ms,
        }
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    dispatcher: DispatcherConfig,
    #[cfg(feature = "hardware")]
    probe: probejob_core::ProbeRsConfig,
}

impl Config {
    fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let s = s.trim_start_matches("0x");
    hex::decode(s)
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(job_error) = e.downcast_ref::<JobError>() {
                eprintln!("{:#}", output::error(job_error));
                ExitCode::from(u8::try_from(job_error.errno()).unwrap_or(u8::MAX))
            } else {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(workers) = cli.workers {
        config.dispatcher.workers = workers;
    }
    if let Some(timeout) = cli.lock_timeout_ms {
        config.dispatcher.lock_timeout = Duration::from_millis(timeout);
    }

    if cli.mock {
        info!("Starting in MOCK mode. No hardware will be accessed.");
        let mut driver = MockDriver::new().with_rtt_control_block(
            MOCK_RTT_CONTROL_BLOCK,
            &[("Terminal", 1024)],
            &[("Terminal", 16)],
        );
        driver.push_rtt_up(0, b"Hello from the simulated target\n");
        let mut dispatcher = Dispatcher::new(driver, config.dispatcher);
        return execute(&mut dispatcher, cli);
    }

    #[cfg(feature = "hardware")]
    {
        let driver = probejob_core::ProbeRsDriver::new(config.probe);
        let mut dispatcher = Dispatcher::new(driver, config.dispatcher);
        execute(&mut dispatcher, cli)
    }
    #[cfg(not(feature = "hardware"))]
    {
        bail!("Built without hardware support, use --mock")
    }
}

fn execute<D: Driver>(dispatcher: &mut Dispatcher<D>, cli: Cli) -> Result<()> {
    let bind = |job: Job| {
        let job = job.with_coprocessor(cli.core.into());
        let job = match &cli.serial {
            Some(serial) => job.with_serial_number(serial.clone()),
            None => job,
        };
        match cli.probe_index {
            Some(index) => job.with_probe(ProbeHandle(index)),
            None => job,
        }
    };

    let job = match cli.command {
        Commands::Version => Job::library_version(),
        Commands::LibraryInfo => Job::library_info(),
        Commands::Probes => Job::connected_devices(),
        Commands::Serials => Job::serial_numbers(),
        Commands::DeviceInfo => Job::device_info(),
        Commands::ProbeInfo => Job::probe_info(),
        Commands::DeviceVersion => Job::device_version(),
        Commands::Read { address, length } => Job::read(address, length)?,
        Commands::ReadU32 { address } => Job::read_u32(address)?,
        Commands::Write { address, data } => Job::write(address, parse_hex_bytes(&data)?)?,
        Commands::WriteU32 { address, value } => Job::write_u32(address, value)?,
        Commands::Program { file, format, base_address, chip_erase, qspi_erase, no_verify } => {
            let options = ProgramOptions {
                verify: !no_verify,
                chip_erase_mode: chip_erase.into(),
                qspi_erase_mode: qspi_erase.into(),
            };
            program_job(file, format, base_address, options)?
        }
        Commands::Dfu { file } => Job::program_dfu(file),
        Commands::McubootDfu { file, uart } => Job::program_mcuboot_dfu(uart.into_request(file))?,
        Commands::ModemDfu { file, uart } => Job::program_modem_uart_dfu(uart.into_request(file))?,
        Commands::Verify { file } => Job::verify(file),
        Commands::ReadToFile { file, ram, code, uicr, qspi } => {
            let options = if ram || code || uicr || qspi {
                ReadOptions { ram, code, uicr, qspi }
            } else {
                ReadOptions::default()
            };
            Job::read_to_file(file, options)?
        }
        Commands::Erase { mode, start, end } => Job::erase(mode.into(), start, end)?,
        Commands::Recover => Job::recover(),
        Commands::Reset => Job::reset(),
        Commands::Open => Job::open(),
        Commands::Close => Job::close(),
        Commands::Rtt { address, channel, send, duration_ms, clock_speed_khz } => {
            let connection = RttConnection { clock_speed_khz, ..RttConnection::default() };
            let session = RttSession { address, channel, send, duration: Duration::from_millis(duration_ms) };
            return session.run(dispatcher, connection, bind);
        }
    };

    let response = submit(dispatcher, bind(job))?;
    println!("{:#}", output::response(&response));
    Ok(())
}

fn program_job(file: PathBuf, format: FormatArg, base_address: u32, options: ProgramOptions) -> Result<Job> {
    let job = match format.resolve(&file) {
        FormatArg::Hex => Job::program_file(file, InputFormat::Hex, options),
        FormatArg::Elf | FormatArg::Auto => Job::program_file(file, InputFormat::Elf, options),
        FormatArg::Bin => {
            let data = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            Job::program_image(file.display().to_string(), FirmwareImage::single(base_address, data), options)?
        }
    };
    Ok(job)
}

/// Run one job to completion, logging its progress.
fn submit<D: Driver>(dispatcher: &mut Dispatcher<D>, job: Job) -> Result<JobResponse> {
    let slot = std::rc::Rc::new(std::cell::RefCell::new(None));
    let id = {
        let slot = std::rc::Rc::clone(&slot);
        dispatcher.submit_with_progress(
            job,
            |update| info!("{update}"),
            move |result| *slot.borrow_mut() = Some(result),
        )
    };
    dispatcher.wait(id);
    let result = slot.borrow_mut().take();
    match result {
        Some(result) => Ok(result?),
        None => bail!("Job {id} finished without a result"),
    }
}

struct RttSession {
    address: Option<u32>,
    channel: u32,
    send: Option<String>,
    duration: Duration,
}

impl RttSession {
    fn run<D: Driver>(
        self,
        dispatcher: &mut Dispatcher<D>,
        connection: RttConnection,
        bind: impl Fn(Job) -> Job,
    ) -> Result<()> {
        let start = submit(dispatcher, bind(Job::rtt_start(self.address, connection)))?;
        eprintln!("{:#}", output::response(&start));

        let outcome = self.exchange(dispatcher, &bind);

        let stop = submit(dispatcher, bind(Job::rtt_stop()));
        if let Err(e) = &stop {
            warn!("Failed to stop RTT: {e:#}");
        }
        outcome
    }

    fn exchange<D: Driver>(&self, dispatcher: &mut Dispatcher<D>, bind: &impl Fn(Job) -> Job) -> Result<()> {
        if let Some(text) = &self.send {
            let written = submit(dispatcher, bind(Job::rtt_write(self.channel, text.clone().into_bytes())?))?;
            info!("Sent {:?}", written.values.first());
        }

        let deadline = Instant::now() + self.duration;
        let mut stdout = std::io::stdout().lock();
        while Instant::now() < deadline {
            let read = submit(dispatcher, bind(Job::rtt_read(self.channel, 1024)?))?;
            match read.values.first().and_then(probejob_core::OutputValue::as_text) {
                Some(text) if !text.is_empty() => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x20000000"), Ok(0x2000_0000));
        assert_eq!(parse_hex("1000"), Ok(0x1000));
        assert!(parse_hex("xyz").is_err());
        assert_eq!(parse_hex_bytes("DEADBEEF").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_format_guessing() {
        assert!(FormatArg::Auto.resolve(Path::new("app.HEX")) == FormatArg::Hex);
        assert!(FormatArg::Auto.resolve(Path::new("app.bin")) == FormatArg::Bin);
        assert!(FormatArg::Auto.resolve(Path::new("app.elf")) == FormatArg::Elf);
        assert!(FormatArg::Hex.resolve(Path::new("app.bin")) == FormatArg::Hex);
    }

    #[test]
    fn test_config_file_layout() {
        let config: Config =
            serde_json::from_str(r#"{ "dispatcher": { "workers": 2, "lock_timeout_ms": 250 } }"#).unwrap();
        assert_eq!(config.dispatcher.workers, 2);
        assert_eq!(config.dispatcher.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_mock_read_through_dispatcher() {
        let cli = Cli::parse_from(["probejob", "--mock", "read", "0x1000", "4"]);
        assert!(run(cli).is_ok());

        let cli = Cli::parse_from(["probejob", "--mock", "--serial", "1234", "read", "0x1000", "4"]);
        let err = run(cli).unwrap_err();
        let job_error = err.downcast_ref::<JobError>().unwrap();
        assert_eq!(job_error.result(), probejob_core::ResultCode::CouldNotOpenDevice);
    }

    #[test]
    fn test_mock_rtt_session() {
        let cli = Cli::parse_from(["probejob", "--mock", "rtt", "--duration-ms", "20", "--send", "hi"]);
        assert!(run(cli).is_ok());
    }
}
