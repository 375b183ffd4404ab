//! Shared application state, composed once at startup.

use crate::auth::AuthGate;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::exec::CommandRunner;
use crate::files::FileService;
use crate::pty::NativePtySpawner;
use crate::sandbox::PathSandbox;
use crate::terminal::TerminalManager;
use std::sync::Arc;
use std::time::Instant;

/// Handles to every service. Cloning is cheap; everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub auth: AuthGate,
    pub sandbox: PathSandbox,
    pub files: FileService,
    pub runner: CommandRunner,
    pub terminals: TerminalManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let sandbox = PathSandbox::new(&config.root)?;
        let files = FileService::new(
            sandbox.clone(),
            config.max_file_size,
            config.allowed_extensions.clone(),
        );
        let runner = CommandRunner::new(sandbox.clone(), &config.shell, config.command_timeout);
        let terminals = TerminalManager::new(
            Arc::new(NativePtySpawner::new(&config.shell)),
            sandbox.root(),
        );

        Ok(Self {
            auth: AuthGate::new(&config.token),
            config: Arc::new(config),
            sandbox,
            files,
            runner,
            terminals,
            started_at: Instant::now(),
        })
    }
}
