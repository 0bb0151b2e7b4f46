use clap::Parser;

fn main() -> anyhow::Result<()> {
    venture_canvas_cli::init_tracing();
    let cli = venture_canvas_cli::Cli::parse();
    venture_canvas_cli::run_cli(cli)
}
