use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::function::Function;
use crate::model::User;

/// Static association of aliases to a function
#[derive(Clone)]
pub struct Command {
    pub aliases: Vec<String>,
    pub admin_only: bool,
    pub function: Arc<dyn Function>,
}

impl Command {
    pub fn new<F: Function + 'static>(aliases: &[&str], function: F) -> Self {
        Self {
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            admin_only: false,
            function: Arc::new(function),
        }
    }

    /// A function reachable only by name (chaining, resumption, engine use)
    pub fn internal<F: Function + 'static>(function: F) -> Self {
        Self::new(&[], function)
    }

    pub fn admin(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn allows(&self, user: &User) -> bool {
        !self.admin_only || user.is_admin
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Function not implemented")]
    NotFound,
    #[error("Warning: more than one function associated to this alias")]
    Ambiguous,
    #[error("Forbidden: this command is reserved to admins")]
    Forbidden,
}

/// Immutable alias table built once per manager
pub struct CommandRegistry {
    commands: Vec<Command>,
    by_alias: HashMap<String, Vec<usize>>,
    by_name: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new(commands: Vec<Command>) -> Self {
        let mut by_alias: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_name = HashMap::new();

        for (index, command) in commands.iter().enumerate() {
            for alias in &command.aliases {
                by_alias.entry(alias.to_lowercase()).or_default().push(index);
            }
            let name = command.function.name();
            if by_name.contains_key(name) {
                warn!("Function '{}' registered twice; keeping the first", name);
            } else {
                by_name.insert(name, index);
            }
        }

        for (alias, indexes) in &by_alias {
            if indexes.len() > 1 {
                warn!("Alias '{}' maps to {} functions", alias, indexes.len());
            }
        }

        info!(
            "Command registry built: {} function(s), {} alias(es)",
            commands.len(),
            by_alias.len()
        );

        Self {
            commands,
            by_alias,
            by_name,
        }
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.by_alias.contains_key(&alias.to_lowercase())
    }

    /// Resolve an alias (case-insensitive) for the given user
    pub fn resolve(&self, alias: &str, user: &User) -> Result<&Command, ResolveError> {
        let indexes = self
            .by_alias
            .get(&alias.to_lowercase())
            .ok_or(ResolveError::NotFound)?;

        let allowed: Vec<&Command> = indexes
            .iter()
            .map(|&i| &self.commands[i])
            .filter(|c| c.allows(user))
            .collect();

        match allowed.as_slice() {
            [] => Err(ResolveError::Forbidden),
            [command] => Ok(command),
            _ => Err(ResolveError::Ambiguous),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&Command> {
        self.by_name.get(name).map(|&i| &self.commands[i])
    }

    /// First alias of every command the user may invoke
    pub fn visible_aliases(&self, user: &User) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| c.allows(user))
            .filter_map(|c| c.aliases.first().map(String::as_str))
            .collect()
    }
}
