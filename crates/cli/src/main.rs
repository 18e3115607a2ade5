use clap::{Parser, Subcommand};
use nx_install::snafu::ErrorCompat;

mod install;

#[derive(Parser)]
#[clap(version = "0.1.0")]
struct Opts {
    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    Install(install::Opts),
}

fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let result = match opts.action {
        Action::Install(opts) => install::main(opts),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        eprintln!("Caused by:");
        for cause in e.iter_chain().skip(1) {
            eprintln!(" - {}", cause);
        }
        std::process::exit(1);
    }
}
