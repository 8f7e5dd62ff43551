use tmux_interface::{HasSession, KillSession, NewSession, SendKeys, Tmux};

/// A detached tmux session
pub struct TmuxSession {
    pub name: String,
}

impl TmuxSession {
    /// Create a new detached tmux session with the given name
    pub fn new(name: String) -> anyhow::Result<Self> {
        let output = Tmux::with_command(NewSession::new().detached().session_name(&name))
            .output()
            .map_err(|e| anyhow::anyhow!("Failed to create tmux session {}: {}", name, e))?;
        if !output.success() {
            anyhow::bail!("tmux refused to create session {}", name);
        }

        // Allow the session's shell to initialize before sending keys
        std::thread::sleep(std::time::Duration::from_millis(300));

        Ok(Self { name })
    }

    /// Type a command into the session's shell and press Enter
    pub fn send_command(&self, command: &str) -> anyhow::Result<()> {
        Tmux::new()
            .add_command(SendKeys::new().target_pane(&self.name).key(command))
            .add_command(SendKeys::new().target_pane(&self.name).key("Enter"))
            .output()
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Failed to send command to tmux session: {}", e))
    }
}

pub fn is_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn is_session_exist(name: &str) -> bool {
    Tmux::with_command(HasSession::new().target_session(name))
        .output()
        .map(|output| output.success())
        .unwrap_or(false)
}

pub fn kill_session(name: &str) -> anyhow::Result<()> {
    let output = Tmux::with_command(KillSession::new().target_session(name))
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to kill tmux session: {}", e))?;
    if !output.success() {
        anyhow::bail!("tmux could not kill session {}", name);
    }
    Ok(())
}
