use std::path::PathBuf;

use super::fail;

pub fn run(host: &str, port: u16, output: PathBuf) {
    let base = format!("http://{host}:{port}");

    println!("rngcollect server v{}", rngcollect_core::VERSION);
    println!("   {base}");
    println!("   captures -> {}", output.display());
    println!();
    println!("   Endpoints:");
    println!("     GET  /                 API index");
    println!("     GET  /sources          Sources and availability");
    println!("     GET  /session          Current session snapshot");
    println!("     POST /session/start    Start a session (JSON body)");
    println!("     POST /session/pause    Pause sampling");
    println!("     POST /session/resume   Resume sampling");
    println!("     POST /session/stop     Stop and finish the capture");
    println!();
    println!("   Example:");
    println!(
        "     curl -X POST {base}/session/start -H 'content-type: application/json' \\\n       -d '{{\"source\":\"pseudo\",\"sample_size_bits\":2048,\"frequency_secs\":1,\"duration_secs\":60}}'"
    );
    println!();

    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(e));
    if let Err(e) = rt.block_on(rngcollect_server::run_server(host, port, output)) {
        fail(e);
    }
}
