mod audit;
mod certs;
mod child_env;
mod config;
mod interceptor;
mod logging;
mod oracle;
mod proxy;
mod registry;
mod rewriter;
mod wrapper;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // A panic anywhere must still produce a clean failure status.
    let outcome = tokio::spawn(wrapper::run(args)).await;
    let code = match outcome {
        Ok(code) => code,
        Err(error) => {
            logging::flush();
            eprintln!("safe-chain aborted: {}", error);
            1
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}
