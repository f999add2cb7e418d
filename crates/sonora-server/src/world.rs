//! World collaborators
//!
//! The scheduler does not own the simulation. It asks a [`World`] where the
//! observers are and whether each bound position still holds a powered
//! speaker, once per tick.

use ahash::AHashMap;
use sonora_core::{BlockPos, ObserverId, Vec3};

/// A listener that can receive directives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub id: ObserverId,
    pub position: Vec3,
}

/// Activation signal of a bound position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Powered,
    Unpowered,
    /// The object was removed or replaced by something else
    Missing,
}

impl Activation {
    pub fn is_powered(&self) -> bool {
        matches!(self, Self::Powered)
    }
}

/// Read-only view of the simulation
pub trait World {
    /// Every observer currently present
    fn observers(&self) -> Vec<Observer>;

    /// Activation of the object at `pos`
    fn activation(&self, pos: BlockPos) -> Activation;
}

/// Scriptable world used by tests, benchmarks and the simulator
#[derive(Debug, Default, Clone)]
pub struct SimulatedWorld {
    observers: Vec<Observer>,
    blocks: AHashMap<BlockPos, bool>,
}

impl SimulatedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an unpowered object at `pos`
    pub fn place(&mut self, pos: BlockPos) {
        self.blocks.insert(pos, false);
    }

    /// Remove the object at `pos`
    pub fn remove(&mut self, pos: BlockPos) {
        self.blocks.remove(&pos);
    }

    /// Set the activation signal at `pos`, placing the object if needed
    pub fn set_powered(&mut self, pos: BlockPos, powered: bool) {
        self.blocks.insert(pos, powered);
    }

    /// Add an observer, or move it if already present
    pub fn move_observer(&mut self, id: ObserverId, position: Vec3) {
        match self.observers.iter_mut().find(|o| o.id == id) {
            Some(observer) => observer.position = position,
            None => self.observers.push(Observer { id, position }),
        }
    }

    /// Remove an observer
    pub fn remove_observer(&mut self, id: ObserverId) {
        self.observers.retain(|o| o.id != id);
    }
}

impl World for SimulatedWorld {
    fn observers(&self) -> Vec<Observer> {
        self.observers.clone()
    }

    fn activation(&self, pos: BlockPos) -> Activation {
        match self.blocks.get(&pos) {
            Some(true) => Activation::Powered,
            Some(false) => Activation::Unpowered,
            None => Activation::Missing,
        }
    }
}
