use {
    std::process::Stdio,
    tokio::{process::Command, sync::mpsc},
};

/// A running hook command (`runOnInit`, `runOnDemand`, `runOnReady`,
/// `runOnRead`, `runOnPublish`). The command string is executed through a
/// shell with `RTSP_PATH`, `RTSP_PORT` and `G1..Gn` in its environment;
/// with `restart` the command is relaunched whenever it exits.
pub struct HookCommand {
    close_tx: mpsc::UnboundedSender<()>,
}

impl HookCommand {
    pub fn spawn(cmdline: String, env: Vec<(String, String)>, restart: bool) -> Self {
        let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                let mut command = Command::new("sh");
                command
                    .arg("-c")
                    .arg(&cmdline)
                    .stdin(Stdio::null())
                    .kill_on_drop(true);
                for (k, v) in &env {
                    command.env(k, v);
                }

                let mut child = match command.spawn() {
                    Ok(child) => child,
                    Err(err) => {
                        log::error!("hook command '{}' failed to start: {}", cmdline, err);
                        return;
                    }
                };

                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => log::info!(
                                "hook command exited with code {}",
                                status.code().unwrap_or(-1)
                            ),
                            Err(err) => log::error!("hook command wait error: {}", err),
                        }
                        if !restart {
                            return;
                        }
                        // relaunch after a short pause, interruptible by close
                        tokio::select! {
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                            _ = close_rx.recv() => {
                                return;
                            }
                        }
                    }
                    _ = close_rx.recv() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return;
                    }
                }
            }
        });

        Self { close_tx }
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(());
    }
}

impl Drop for HookCommand {
    fn drop(&mut self) {
        let _ = self.close_tx.send(());
    }
}
