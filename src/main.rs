//! User-space runtime for a USB Video Class (UVC) gadget function: reads
//! gadget configuration, opens the kernel device node, and runs the
//! control/stream reactor loop until interrupted.

mod config;
mod control;
mod error;
mod orchestrator;
mod pool;
mod reactor;
mod sink;
mod source;
mod uvc;
mod v4l2_sys;

use std::cell::RefCell;
use std::path::Path;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;

use config::read_function_config;
use error::Result;
use orchestrator::Orchestrator;
use reactor::{Interest, Reactor};
use sink::Sink;
use source::StaticSource;
use uvc::UvcControlStateMachine;

/// Root of the kernel's gadget configfs tree (§6).
const GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";

const USAGE: &str = "Usage: uvc-gadget-daemon [-v]... [--video-node <path>] <uvc-device>";

#[derive(Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Function name (uvc.0) or fully qualified gadget path (g1/functions/uvc.0).
    uvc_device: String,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the UDC-binding traversal and use this device node
    /// directly (spec §A.4: for test rigs with no bound UDC).
    #[arg(long = "video-node")]
    video_node: Option<std::path::PathBuf>,
}

fn main() -> ExitCode {
    // -h/--help is special-cased ahead of clap parsing to match the exact
    // usage-to-stderr/exit-0 contract of §6, rather than clap's own
    // usage-to-stdout default.
    let args: Vec<String> = std::env::args().collect();
    if args.iter().skip(1).any(|a| a == "-h" || a == "--help") {
        eprintln!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(cli.verbose);

    match run(&cli.uvc_device, cli.video_node.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(uvc_device: &str, video_node_override: Option<&Path>) -> Result<()> {
    // 1. Parse function specifier, read configuration.
    let config = read_function_config(Path::new(GADGET_ROOT), uvc_device, video_node_override)?;
    log::info!("loaded configuration for {uvc_device}: {} format(s), video node {}", config.num_formats(), config.video_node.display());

    // 2. Initialize reactor. Install SIGINT handler -> reactor.stop.
    let reactor = Rc::new(Reactor::new().map_err(|e| error::Error::resource("reactor init", e.into()))?);
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, reactor.wakeup_fd())
        .map_err(|e| error::Error::resource("SIGINT handler install", e))?;

    // 3. Create the static video source.
    let source: Box<dyn source::VideoSource> = Box::new(StaticSource::new());

    // 4. Open sink device node. Subscribe to the four UVC events.
    let sink = Rc::new(RefCell::new(Sink::open(&config.video_node)?));
    sink.borrow().subscribe_events()?;

    let orchestrator = Rc::new(RefCell::new(Orchestrator::new(sink.clone(), source, reactor.clone())));

    // 5. Initialize probe & commit to (format=1, frame=1, interval=0).
    let control_sm = Rc::new(RefCell::new(UvcControlStateMachine::new(config, sink.clone(), orchestrator.clone())));

    // 6. Register sink handle with reactor for exception readiness -> control SM.
    //    (Buffer-readable readiness is registered separately by the
    //    orchestrator once streaming starts; both watches may coexist on
    //    the same fd, see reactor::Reactor::watch.)
    let sink_fd = sink.borrow().fd();
    let control_sm_for_cb = control_sm.clone();
    reactor.watch(
        sink_fd,
        Interest::EXCEPTION,
        Box::new(move |_fd| {
            control_sm_for_cb.borrow_mut().on_reactor_ready();
        }),
    );

    log::info!("entering reactor loop");

    // 7. Run reactor loop.
    let run_result = reactor.run();

    // 8. On exit: stream_off if Streaming; release buffers; close sink;
    //    destroy source; free configuration (drop order handles the rest).
    log::debug!("shutting down from state {:?}", orchestrator.borrow().state());
    Orchestrator::shutdown(&orchestrator);
    log::info!("shutdown complete");

    run_result.map_err(|e| error::Error::resource("reactor run", e.into()))
}
