fn main() {
    if let Err(err) = janus_gateway::cli::run_janus() {
        tracing::error!(error = %err, "janus failed");
        std::process::exit(1);
    }
}
