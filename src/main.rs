mod cli;

use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use segcast_core::error::EngineError;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let job = match cli::parse(&args) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("segcast: {e}");
            eprintln!("{}", cli::USAGE);
            return ExitCode::from(8);
        }
    };

    match run(&job) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("segcast: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(job: &cli::Job) -> Result<(), EngineError> {
    segcast_engine::init()?;

    let input = segcast_engine::InputSpec::file(&job.input);
    let results = segcast_engine::transcode(&input, &job.outputs)?;

    info!(
        frames = results.decoded.frames,
        pixels = results.decoded.pixels,
        "decoded"
    );
    for (spec, encoded) in job.outputs.iter().zip(&results.encoded) {
        info!(
            output = %spec.path,
            frames = encoded.frames,
            pixels = encoded.pixels,
            "encoded"
        );
    }

    segcast_engine::deinit();
    Ok(())
}
