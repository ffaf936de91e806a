use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;

/// Whether the user asked us to stop. Interrupting cancels the token that
/// every registry pass runs under; operations already in flight finish.
#[derive(Clone, Debug)]
pub struct InterruptState {
    token: CancellationToken,
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        if !interrupted.is_interrupted() {
            eprintln!("Interrupted, waiting for running operations to finish");
        }
        interrupted.set_interrupted();
    })
    .context("Error setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
