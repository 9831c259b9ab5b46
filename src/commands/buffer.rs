use log::error;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::commands::Command;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferType {
    Generic,
    Error,
    Frame,
    New,
    Delete,
}

/// Which side of the [`SceneLock`] has to be held while a buffer is torn down.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DeleteMode {
    #[default]
    Unlocked,
    EditLock,
    RenderLock,
}

const FREE: u8 = 0;
const EDIT: u8 = 1;
const RENDER: u8 = 2;

/// Non-blocking lock pair between the producer (edit side, while it traverses and loads) and the
/// consumer (render side, while it applies node commands). Neither side ever blocks on it: a
/// failed attempt is retried later, see [`crate::util::Backoff`].
#[derive(Default)]
pub struct SceneLock {
    state: AtomicU8,
}

impl SceneLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock_edit(&self) -> bool {
        self.state
            .compare_exchange(FREE, EDIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_lock_render(&self) -> bool {
        self.state
            .compare_exchange(FREE, RENDER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock_edit(&self) {
        if self
            .state
            .compare_exchange(EDIT, FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            error!("Released the edit lock without holding it");
        }
    }

    pub fn unlock_render(&self) {
        if self
            .state
            .compare_exchange(RENDER, FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            error!("Released the render lock without holding it");
        }
    }

    pub fn is_edit_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) == EDIT
    }

    pub fn is_render_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) == RENDER
    }

    pub fn try_edit(&self) -> Option<SceneLockGuard<'_>> {
        self.try_lock_edit().then(|| SceneLockGuard {
            lock: self,
            held: HeldLock::Edit,
        })
    }

    pub fn try_render(&self) -> Option<SceneLockGuard<'_>> {
        self.try_lock_render().then(|| SceneLockGuard {
            lock: self,
            held: HeldLock::Render,
        })
    }
}

impl Debug for SceneLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            EDIT => "edit",
            RENDER => "render",
            _ => "free",
        };
        f.debug_struct("SceneLock").field("state", &state).finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HeldLock {
    Edit,
    Render,
}

impl HeldLock {
    fn release(self, lock: &SceneLock) {
        match self {
            HeldLock::Edit => lock.unlock_edit(),
            HeldLock::Render => lock.unlock_render(),
        }
    }
}

pub struct SceneLockGuard<'a> {
    lock: &'a SceneLock,
    held: HeldLock,
}

impl Drop for SceneLockGuard<'_> {
    fn drop(&mut self) {
        self.held.release(self.lock);
    }
}

/// An ordered batch of commands. Once handed to a queue, the producer must not touch it again.
pub struct CommandBuffer {
    commands: VecDeque<Command>,
    buffer_type: BufferType,
    delete_mode: DeleteMode,
    lock: Arc<SceneLock>,
    held: Option<HeldLock>,
    handed_off: bool,
    /// Commands at the front that the consumer has already applied.
    processed: usize,
}

impl CommandBuffer {
    pub fn new(buffer_type: BufferType) -> Self {
        Self::with_lock(buffer_type, Arc::new(SceneLock::new()))
    }

    /// A buffer whose teardown is negotiated over a shared lock (usually the manager's).
    pub fn with_lock(buffer_type: BufferType, lock: Arc<SceneLock>) -> Self {
        Self {
            commands: VecDeque::new(),
            buffer_type,
            delete_mode: DeleteMode::Unlocked,
            lock,
            held: None,
            handed_off: false,
            processed: 0,
        }
    }

    pub fn single(buffer_type: BufferType, command: Command) -> Self {
        let mut buffer = Self::new(buffer_type);
        buffer.add_command(command, false);
        buffer
    }

    pub fn add_command(&mut self, command: Command, prepend: bool) {
        debug_assert!(
            !self.handed_off,
            "{} added to a {:?} buffer that has already been handed off",
            command.name(),
            self.buffer_type
        );
        if self.handed_off {
            error!(
                "Refusing to add {} to a {:?} buffer that has already been handed off",
                command.name(),
                self.buffer_type
            );
            return;
        }

        if prepend {
            self.commands.push_front(command);
        } else {
            self.commands.push_back(command);
        }
    }

    pub fn pop_command(&mut self) -> Option<Command> {
        let command = self.commands.pop_front()?;
        self.processed = self.processed.saturating_sub(1);
        Some(command)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Command> + '_ {
        self.processed = 0;
        self.commands.drain(..)
    }

    /// Commands that have not been applied yet. The applied ones stay in the buffer, so their
    /// node references are only released on [`CommandBuffer::teardown`].
    pub fn unprocessed(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().skip(self.processed)
    }

    pub(crate) fn mark_processed(&mut self, count: usize) {
        self.processed = (self.processed + count).min(self.commands.len());
    }

    pub fn is_processed(&self) -> bool {
        self.processed == self.commands.len()
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn entries(&self) -> usize {
        self.commands.len()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.processed = 0;
        self.commands.clear();
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn delete_mode(&self) -> DeleteMode {
        self.delete_mode
    }

    pub fn set_delete_mode(&mut self, delete_mode: DeleteMode) {
        self.delete_mode = delete_mode;
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off
    }

    pub(crate) fn mark_handed_off(&mut self) {
        self.handed_off = true;
    }

    /// Moves the buffer over to `lock`, e.g. when a caller-built buffer enters the manager.
    pub(crate) fn share_lock(&mut self, lock: Arc<SceneLock>) {
        self.unlock();
        self.lock = lock;
    }

    pub fn try_lock_render(&mut self) -> bool {
        match self.held {
            Some(HeldLock::Render) => true,
            Some(HeldLock::Edit) => false,
            None => {
                let locked = self.lock.try_lock_render();
                if locked {
                    self.held = Some(HeldLock::Render);
                }
                locked
            }
        }
    }

    pub fn try_lock_edit(&mut self) -> bool {
        match self.held {
            Some(HeldLock::Edit) => true,
            Some(HeldLock::Render) => false,
            None => {
                let locked = self.lock.try_lock_edit();
                if locked {
                    self.held = Some(HeldLock::Edit);
                }
                locked
            }
        }
    }

    pub fn unlock(&mut self) {
        if let Some(held) = self.held.take() {
            held.release(&self.lock);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Releases the buffer and the node references it still carries, honouring the delete mode.
    /// Hands the buffer back if the required lock is currently unavailable.
    pub fn teardown(mut self) -> Result<(), Self> {
        let needs_lock = self.commands.iter().any(Command::references_nodes);
        if needs_lock {
            // a different lock than the one required may still be held from processing
            let acquired = match self.delete_mode {
                DeleteMode::Unlocked => true,
                DeleteMode::EditLock => {
                    if self.held == Some(HeldLock::Render) {
                        self.unlock();
                    }
                    self.try_lock_edit()
                }
                DeleteMode::RenderLock => {
                    if self.held == Some(HeldLock::Edit) {
                        self.unlock();
                    }
                    self.try_lock_render()
                }
            };

            if !acquired {
                return Err(self);
            }
        }

        self.commands.clear();
        self.unlock();
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("type", &self.buffer_type)
            .field("entries", &self.commands.len())
            .field("delete_mode", &self.delete_mode)
            .field("handed_off", &self.handed_off)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::graph::types::GEOMETRY;
    use crate::graph::{GraphNode, NodeRef};

    fn node_command() -> Command {
        let node: NodeRef = GraphNode::new("mesh", &GEOMETRY);
        Command::new(CommandKind::DeleteNode { node, path_id: 1 })
    }

    #[test]
    fn drain_keeps_insertion_order() {
        let mut buffer = CommandBuffer::new(BufferType::Generic);
        let commands = (0..32)
            .map(|i| Command::new(CommandKind::SetRenderTime { time: i as f64 }))
            .collect::<Vec<_>>();
        let ids = commands.iter().map(Command::id).collect::<Vec<_>>();
        for command in commands {
            buffer.add_command(command, false);
        }

        assert_eq!(buffer.entries(), 32);
        let drained = buffer.drain().map(|c| c.id()).collect::<Vec<_>>();
        assert_eq!(drained, ids);
        assert!(!buffer.has_commands());
    }

    #[test]
    fn prepend_goes_first() {
        let mut buffer = CommandBuffer::new(BufferType::Generic);
        let first = Command::new(CommandKind::ClearMaps);
        let second = Command::new(CommandKind::UnInitialize);
        let second_id = second.id();
        buffer.add_command(first, false);
        buffer.add_command(second, true);
        assert_eq!(buffer.pop_command().map(|c| c.id()), Some(second_id));
    }

    #[test]
    fn processed_commands_stay_until_teardown() {
        let mut buffer = CommandBuffer::new(BufferType::Delete);
        for _ in 0..3 {
            buffer.add_command(node_command(), false);
        }

        assert_eq!(buffer.unprocessed().count(), 3);
        buffer.mark_processed(2);
        assert_eq!(buffer.unprocessed().count(), 1);
        assert_eq!(buffer.entries(), 3);
        assert!(!buffer.is_processed());

        buffer.mark_processed(5);
        assert!(buffer.is_processed());
        assert!(buffer.teardown().is_ok());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn adding_after_handoff_fails_loudly() {
        let mut buffer = CommandBuffer::new(BufferType::Generic);
        buffer.mark_handed_off();
        buffer.add_command(Command::new(CommandKind::ClearMaps), false);
    }

    #[test]
    fn edit_and_render_exclude_each_other() {
        let lock = SceneLock::new();
        let guard = lock.try_edit().expect("lock is free");
        assert!(!lock.try_lock_render());
        assert!(lock.try_edit().is_none());
        drop(guard);
        assert!(lock.try_lock_render());
        assert!(!lock.try_lock_edit());
        lock.unlock_render();
        assert!(!lock.is_render_locked());
    }

    #[test]
    fn teardown_waits_for_the_edit_lock() {
        let lock = Arc::new(SceneLock::new());
        let mut buffer = CommandBuffer::with_lock(BufferType::Delete, lock.clone());
        buffer.add_command(node_command(), false);
        buffer.set_delete_mode(DeleteMode::EditLock);

        let producer = lock.try_edit().expect("lock is free");
        let buffer = buffer.teardown().expect_err("producer holds the edit lock");
        drop(producer);

        assert!(buffer.teardown().is_ok());
        assert!(!lock.is_edit_locked());
    }

    #[test]
    fn teardown_without_node_references_needs_no_lock() {
        let lock = Arc::new(SceneLock::new());
        let mut buffer = CommandBuffer::with_lock(BufferType::Generic, lock.clone());
        buffer.add_command(Command::new(CommandKind::ClearMaps), false);
        buffer.set_delete_mode(DeleteMode::RenderLock);

        let _producer = lock.try_edit().expect("lock is free");
        assert!(buffer.teardown().is_ok());
    }

    #[test]
    fn dropping_a_buffer_releases_its_lock() {
        let lock = Arc::new(SceneLock::new());
        let mut buffer = CommandBuffer::with_lock(BufferType::Frame, lock.clone());
        assert!(buffer.try_lock_render());
        assert!(buffer.try_lock_render());
        assert!(!buffer.try_lock_edit());
        drop(buffer);
        assert!(lock.try_lock_edit());
    }
}
