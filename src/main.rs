use std::io;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use log::{error, info};

use echo_reactor::app;
use echo_reactor::{EchoHandler, Reactor, SocketAcceptor, TcpListener, TcpStream};

/// TCP echo server.
#[derive(Parser, Debug)]
#[command(name = "echod")]
struct Args {
    /// Detach from the terminal and run in the background.
    #[arg(long)]
    daemon: bool,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if e.kind() == ClapErrorKind::DisplayHelp
                || e.kind() == ClapErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            process::exit(app::EXIT_OK);
        }
        Err(e) => {
            let _ = e.print();
            process::exit(app::EXIT_USAGE);
        }
    };

    if args.daemon {
        if let Err(e) = app::daemonize() {
            error!("daemonize failed: {}", e);
            process::exit(app::EXIT_OSERR);
        }
        if std::env::set_current_dir("/").is_err() {
            process::exit(app::EXIT_OSERR);
        }
    }

    match serve(&args) {
        Ok(()) => process::exit(app::EXIT_OK),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            error!("cannot listen on port {}: {}", args.port, e);
            process::exit(app::EXIT_CONFIG);
        }
        Err(e) => {
            error!("server failed: {}", e);
            process::exit(app::EXIT_OSERR);
        }
    }
}

fn serve(args: &Args) -> io::Result<()> {
    // before any thread exists, so every thread inherits the mask
    app::block_termination_signals()?;

    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    info!("listening on {}", listener.local_addr()?);

    let reactor = Arc::new(Reactor::new()?);

    let acceptor = SocketAcceptor::register(
        listener,
        reactor.clone(),
        |socket: TcpStream, reactor: &Arc<Reactor>| {
            if let Err(e) = EchoHandler::register(socket, reactor.clone()) {
                error!("handler registration failed: {}", e);
            }
        },
    )?;

    let runner = reactor.clone();
    let dispatcher = thread::spawn(move || runner.run());

    app::wait_for_termination()?;
    info!("termination requested, stopping");

    reactor.stop();
    if dispatcher.join().is_err() {
        error!("dispatch thread panicked");
    }

    acceptor
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .unregister()?;

    Ok(())
}
