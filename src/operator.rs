use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info};

/// Command typed by a local operator on the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    ResetEnergy,
}

impl OperatorCommand {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'r' | 'R' => Some(OperatorCommand::ResetEnergy),
            _ => None,
        }
    }
}

/// Forwards single-byte commands from a console stream to the control loop
pub struct OperatorConsole<R> {
    input: R,
    commands: Sender<OperatorCommand>,
}

impl OperatorConsole<tokio::io::Stdin> {
    /// Console on stdin plus the receiving end for the control loop
    pub fn stdin() -> (Self, Receiver<OperatorCommand>) {
        Self::new(tokio::io::stdin())
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> OperatorConsole<R> {
    pub fn new(input: R) -> (Self, Receiver<OperatorCommand>) {
        let (commands, rx) = mpsc::channel(8);
        (Self { input, commands }, rx)
    }

    pub fn spawn(mut self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(&mut self) {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let Some(command) = OperatorCommand::from_char(char::from(byte[0])) else {
                        continue;
                    };
                    info!(?command, "Operator command received");
                    if self.commands.send(command).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Operator console closed");
    }
}
