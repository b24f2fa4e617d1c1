fn main() {
    if let Err(err) = session_relay::cli::run_session_relay() {
        tracing::error!(error = %err, "session-relay failed");
        std::process::exit(1);
    }
}
