use apiary_engine::ReplayStopper;

/// First CTRL+C asks the engine for a graceful stop; a second one exits
/// immediately.
pub fn spawn_ctrl_c_handler(stopper: ReplayStopper) {
    tokio::spawn(async move {
        let mut interrupts = 0u8;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            if interrupts == 1 {
                eprintln!(
                    "Interrupted - waiting for workers to finish their current jobs \
                     (press CTRL+C again to exit immediately)."
                );
                stopper.request_stop();
            } else {
                eprintln!("Interrupted again - exiting immediately.");
                std::process::exit(130);
            }
        }
    });
}
