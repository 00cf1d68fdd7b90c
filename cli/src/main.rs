use clap::Parser;
use tanjun::args::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tanjun_common::log::init_tracing(args.verbose);

    if let Err(err) = tanjun::run(args).await {
        // errors surface as one line, with the cause chain inlined
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
