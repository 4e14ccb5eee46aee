//! Sample inventory model
//!
//! An addressable storage tree built once from the static layout and overlaid
//! with live occupancy and identity. Robot storage is Puck -> Pin; tray storage
//! is Row -> Cell -> Drop -> Crystal.
//!
//! The loaded flag is only ever set through [`Inventory::mark_loaded`], which
//! clears every other slot, so at most one slot reports `loaded` at a time.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::address::{row_letter, SlotAddress};
use crate::config::VariantConfig;
use crate::{ChangerError, Result};

/// Inventory shared between the monitor and the exchange orchestrator
pub type SharedInventory = Arc<RwLock<Inventory>>;

/// A leaf position holding at most one sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub address: SlotAddress,
    pub present: bool,
    /// Barcode / datamatrix of the sample, when known
    pub identity: Option<String>,
    pub loaded: bool,
    pub has_been_loaded: bool,
}

impl Slot {
    fn new(address: SlotAddress, present: bool, identity: Option<String>) -> Self {
        Self {
            address,
            present,
            identity,
            loaded: false,
            has_been_loaded: false,
        }
    }

    /// Key used to identify the sample to external flows
    pub fn sample_id(&self) -> String {
        self.identity.clone().unwrap_or_else(|| self.address.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Puck,
    Row,
    Cell,
    Drop,
}

#[derive(Debug, Clone, Serialize)]
pub enum Node {
    Container(Container),
    Slot(Slot),
}

/// Ordered collection of slots or nested containers
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    pub kind: ContainerKind,
    pub label: String,
    pub present: bool,
    pub identity: Option<String>,
    pub scanned: bool,
    pub children: Vec<Node>,
}

impl Container {
    fn new(kind: ContainerKind, label: String, present: bool) -> Self {
        Self {
            kind,
            label,
            present,
            identity: None,
            scanned: false,
            children: Vec::new(),
        }
    }

    fn child_container(&self, index: usize) -> Option<&Container> {
        match self.children.get(index) {
            Some(Node::Container(c)) => Some(c),
            _ => None,
        }
    }

    fn child_container_mut(&mut self, index: usize) -> Option<&mut Container> {
        match self.children.get_mut(index) {
            Some(Node::Container(c)) => Some(c),
            _ => None,
        }
    }

    fn child_slot(&self, index: usize) -> Option<&Slot> {
        match self.children.get(index) {
            Some(Node::Slot(s)) => Some(s),
            _ => None,
        }
    }

    fn child_slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        match self.children.get_mut(index) {
            Some(Node::Slot(s)) => Some(s),
            _ => None,
        }
    }

    fn collect_slots<'a>(&'a self, out: &mut Vec<&'a Slot>) {
        for child in &self.children {
            match child {
                Node::Container(c) => c.collect_slots(out),
                Node::Slot(s) => out.push(s),
            }
        }
    }

    fn for_each_slot_mut(&mut self, f: &mut dyn FnMut(&mut Slot)) {
        for child in &mut self.children {
            match child {
                Node::Container(c) => c.for_each_slot_mut(f),
                Node::Slot(s) => f(s),
            }
        }
    }
}

/// Presence metadata for a top-level container, as reported by the actuator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    /// Robot numbering (1-based puck id)
    pub id: u32,
    /// Barcode reported by the robot, e.g. `ASP-3018`
    pub barcode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    layout: VariantConfig,
    containers: Vec<Container>,
}

impl Inventory {
    pub fn from_config(layout: &VariantConfig) -> Self {
        match *layout {
            VariantConfig::Robot { pucks, pins_per_puck } => Self::robot(pucks, pins_per_puck),
            VariantConfig::Tray { rows, columns, drops } => Self::tray(rows, columns, drops),
        }
    }

    /// Pucks numbered `1..=pucks`, each holding pins `1..=pins_per_puck`
    pub fn robot(pucks: u32, pins_per_puck: u32) -> Self {
        let containers = (1..=pucks)
            .map(|puck| {
                let mut container = Container::new(ContainerKind::Puck, puck.to_string(), false);
                container.children = (1..=pins_per_puck)
                    .map(|pin| {
                        Node::Slot(Slot::new(
                            SlotAddress::pin(puck, pin),
                            false,
                            Some(placeholder_datamatrix(puck, pin)),
                        ))
                    })
                    .collect();
                container
            })
            .collect();

        Self {
            layout: VariantConfig::Robot { pucks, pins_per_puck },
            containers,
        }
    }

    /// Rows `A..`, columns `1..=columns`, drops `1..=drops`, one crystal per drop
    pub fn tray(rows: u32, columns: u32, drops: u32) -> Self {
        let containers = (0..rows)
            .map(|row| {
                let mut row_container =
                    Container::new(ContainerKind::Row, row_letter(row).to_string(), true);
                row_container.children = (1..=columns)
                    .map(|column| {
                        let mut cell = Container::new(
                            ContainerKind::Cell,
                            format!("{}{}", row_letter(row), column),
                            true,
                        );
                        cell.children = (1..=drops)
                            .map(|drop| {
                                let mut drop_container = Container::new(
                                    ContainerKind::Drop,
                                    format!("{}{}:{}", row_letter(row), column, drop),
                                    true,
                                );
                                drop_container.children = vec![Node::Slot(Slot::new(
                                    SlotAddress::crystal(row, column, drop, 0),
                                    true,
                                    None,
                                ))];
                                Node::Container(drop_container)
                            })
                            .collect();
                        Node::Container(cell)
                    })
                    .collect();
                row_container
            })
            .collect();

        Self {
            layout: VariantConfig::Tray { rows, columns, drops },
            containers,
        }
    }

    pub fn layout(&self) -> &VariantConfig {
        &self.layout
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Parse an address with this inventory's grammar
    pub fn parse_address(&self, input: &str) -> Result<SlotAddress> {
        match self.layout {
            VariantConfig::Robot { .. } => SlotAddress::parse_pin(input),
            VariantConfig::Tray { .. } => SlotAddress::parse_well(input),
        }
    }

    pub fn resolve(&self, address: &SlotAddress) -> Result<&Slot> {
        let unknown = || ChangerError::UnknownSlot(address.to_string());
        match (self.layout.clone(), *address) {
            (VariantConfig::Robot { .. }, SlotAddress::Pin { puck, pin }) => {
                let puck_idx = index_from_one(puck).ok_or_else(unknown)?;
                let pin_idx = index_from_one(pin).ok_or_else(unknown)?;
                self.containers
                    .get(puck_idx)
                    .and_then(|c| c.child_slot(pin_idx))
                    .ok_or_else(unknown)
            }
            (VariantConfig::Tray { .. }, SlotAddress::Crystal { row, column, drop, crystal }) => {
                let column_idx = index_from_one(column).ok_or_else(unknown)?;
                let drop_idx = index_from_one(drop).ok_or_else(unknown)?;
                self.containers
                    .get(row as usize)
                    .and_then(|r| r.child_container(column_idx))
                    .and_then(|cell| cell.child_container(drop_idx))
                    .and_then(|d| d.child_slot(crystal as usize))
                    .ok_or_else(unknown)
            }
            _ => Err(unknown()),
        }
    }

    /// Parse and resolve in one step
    pub fn resolve_str(&self, input: &str) -> Result<&Slot> {
        let address = self.parse_address(input)?;
        self.resolve(&address)
    }

    fn resolve_mut(&mut self, address: &SlotAddress) -> Result<&mut Slot> {
        let unknown = || ChangerError::UnknownSlot(address.to_string());
        match (self.layout.clone(), *address) {
            (VariantConfig::Robot { .. }, SlotAddress::Pin { puck, pin }) => {
                let puck_idx = index_from_one(puck).ok_or_else(unknown)?;
                let pin_idx = index_from_one(pin).ok_or_else(unknown)?;
                self.containers
                    .get_mut(puck_idx)
                    .and_then(|c| c.child_slot_mut(pin_idx))
                    .ok_or_else(unknown)
            }
            (VariantConfig::Tray { .. }, SlotAddress::Crystal { row, column, drop, crystal }) => {
                let column_idx = index_from_one(column).ok_or_else(unknown)?;
                let drop_idx = index_from_one(drop).ok_or_else(unknown)?;
                self.containers
                    .get_mut(row as usize)
                    .and_then(|r| r.child_container_mut(column_idx))
                    .and_then(|cell| cell.child_container_mut(drop_idx))
                    .and_then(|d| d.child_slot_mut(crystal as usize))
                    .ok_or_else(unknown)
            }
            _ => Err(unknown()),
        }
    }

    /// Every leaf slot, in storage order
    pub fn all_slots(&self) -> Vec<&Slot> {
        let mut slots = Vec::new();
        for container in &self.containers {
            container.collect_slots(&mut slots);
        }
        slots
    }

    pub fn loaded_slot(&self) -> Option<&Slot> {
        self.all_slots().into_iter().find(|slot| slot.loaded)
    }

    pub fn loaded_address(&self) -> Option<SlotAddress> {
        self.loaded_slot().map(|slot| slot.address)
    }

    fn for_each_slot_mut(&mut self, mut f: impl FnMut(&mut Slot)) {
        for container in &mut self.containers {
            container.for_each_slot_mut(&mut f);
        }
    }

    /// Mark `address` as the mounted slot, clearing every other loaded flag.
    ///
    /// Returns the previously loaded address when it differs.
    pub fn mark_loaded(&mut self, address: &SlotAddress) -> Result<Option<SlotAddress>> {
        // Validate first so a bad address leaves the inventory untouched
        self.resolve(address)?;

        let mut previous = None;
        self.for_each_slot_mut(|slot| {
            if slot.address == *address {
                slot.loaded = true;
                slot.has_been_loaded = true;
            } else if slot.loaded {
                previous = Some(slot.address);
                slot.loaded = false;
            }
        });
        Ok(previous)
    }

    /// Clear every loaded flag; returns the address that was loaded
    pub fn clear_loaded(&mut self) -> Option<SlotAddress> {
        let mut previous = None;
        self.for_each_slot_mut(|slot| {
            if slot.loaded {
                previous = Some(slot.address);
                slot.loaded = false;
            }
        });
        previous
    }

    /// Clear loaded and has-been-loaded on every slot
    pub fn reset_loaded_history(&mut self) {
        self.for_each_slot_mut(|slot| {
            slot.loaded = false;
            slot.has_been_loaded = false;
        });
    }

    /// Make the loaded flags reflect `mounted`; returns true when anything changed
    pub fn sync_loaded(&mut self, mounted: Option<&SlotAddress>) -> Result<bool> {
        let current = self.loaded_address();
        if current.as_ref() == mounted {
            return Ok(false);
        }
        match mounted {
            Some(address) => {
                self.mark_loaded(address)?;
            }
            None => {
                self.clear_loaded();
            }
        }
        Ok(true)
    }

    pub fn set_slot_info(&mut self, address: &SlotAddress, present: bool, identity: Option<String>) -> Result<()> {
        let slot = self.resolve_mut(address)?;
        slot.present = present;
        slot.identity = identity;
        Ok(())
    }

    /// Update a top-level container's metadata; `index` is the container's
    /// own numbering (puck id, or zero-based row)
    pub fn set_container_info(
        &mut self,
        index: u32,
        present: bool,
        identity: Option<String>,
        scanned: bool,
    ) -> Result<()> {
        let position = match self.layout {
            VariantConfig::Robot { .. } => index_from_one(index),
            VariantConfig::Tray { .. } => Some(index as usize),
        };
        let container = position
            .and_then(|p| self.containers.get_mut(p))
            .ok_or_else(|| ChangerError::UnknownSlot(format!("container {}", index)))?;
        container.present = present;
        container.identity = identity;
        container.scanned = scanned;
        Ok(())
    }

    /// Overlay robot puck presence onto pucks and their pins.
    ///
    /// Pins of a present puck take the robot's pin label as identity; pins of
    /// an absent puck fall back to the placeholder datamatrix.
    pub fn apply_puck_presence(&mut self, loaded_pucks: &[ContainerInfo]) -> Result<()> {
        let pucks: Vec<u32> = match self.layout {
            VariantConfig::Robot { pucks, .. } => (1..=pucks).collect(),
            VariantConfig::Tray { .. } => return Ok(()),
        };

        for puck in pucks {
            let info = loaded_pucks.iter().find(|p| p.id == puck);
            self.set_container_info(puck, info.is_some(), info.map(|p| p.barcode.clone()), false)?;

            let pins: Vec<SlotAddress> = self.containers[(puck - 1) as usize]
                .children
                .iter()
                .filter_map(|node| match node {
                    Node::Slot(s) => Some(s.address),
                    _ => None,
                })
                .collect();
            for address in pins {
                let identity = match (info, address) {
                    (Some(p), SlotAddress::Pin { pin, .. }) => format!("{}-{}", p.barcode, pin),
                    (_, SlotAddress::Pin { puck, pin }) => placeholder_datamatrix(puck, pin),
                    (_, other) => other.to_string(),
                };
                self.set_slot_info(&address, info.is_some(), Some(identity))?;
            }
        }
        Ok(())
    }
}

fn index_from_one(n: u32) -> Option<usize> {
    (n as usize).checked_sub(1)
}

fn placeholder_datamatrix(puck: u32, pin: u32) -> String {
    format!("matr{}_{}", puck, pin)
}
