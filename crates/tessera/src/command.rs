//! Handler commands: how a handler directs the executor.
//!
//! A handler invoked by `EntityStore::run` returns zero or more [`Command`]s
//! telling the executor what to do with the current entity and the iteration.
//! For ergonomics a handler may return `()`, a single `Command`, an
//! `Option<Command>`, or a `Vec<Command>` -- anything convertible into a
//! [`CommandSet`].

/// A single instruction from a handler to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Persist the current entity's loaded components.
    SaveEntity,
    /// Delete the current entity from the backend. Takes precedence over
    /// [`Command::SaveEntity`] within the same batch.
    DeleteEntity,
    /// Stop the iteration after this entity, like a loop `break`.
    Break,
}

/// The full batch of commands returned by one handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet(Vec<Command>);

impl CommandSet {
    /// An empty batch (keep iterating, persist nothing).
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether the batch contains `command`.
    pub fn contains(&self, command: Command) -> bool {
        self.0.contains(&command)
    }

    /// Number of commands in the batch.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<()> for CommandSet {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

impl From<Command> for CommandSet {
    fn from(command: Command) -> Self {
        Self(vec![command])
    }
}

impl From<Option<Command>> for CommandSet {
    fn from(command: Option<Command>) -> Self {
        Self(command.into_iter().collect())
    }
}

impl From<Vec<Command>> for CommandSet {
    fn from(commands: Vec<Command>) -> Self {
        Self(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_converts_to_empty_set() {
        let set: CommandSet = ().into();
        assert!(set.is_empty());
    }

    #[test]
    fn single_command_converts() {
        let set: CommandSet = Command::SaveEntity.into();
        assert_eq!(set.len(), 1);
        assert!(set.contains(Command::SaveEntity));
    }

    #[test]
    fn option_converts() {
        let some: CommandSet = Some(Command::Break).into();
        assert!(some.contains(Command::Break));
        let none: CommandSet = None::<Command>.into();
        assert!(none.is_empty());
    }

    #[test]
    fn vec_converts() {
        let set: CommandSet = vec![Command::SaveEntity, Command::Break].into();
        assert!(set.contains(Command::SaveEntity));
        assert!(set.contains(Command::Break));
        assert!(!set.contains(Command::DeleteEntity));
    }
}
