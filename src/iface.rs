//! Network interface table (C7): binds bearers to interfaces, applies input/output filters, and
//! keeps the per-interface RX/TX counters (§4.7, and the counters supplement carried over from
//! the original node's interface statistics).

use heapless::consts::U4;
use heapless::Vec;

use crate::bearer::BearerHandle;
use crate::error::Error;

/// Default number of interfaces a node can register.
pub type DefaultIfaceCapacity = U4;

/// Decides whether a PDU should be allowed to pass in a given direction. The default filter
/// passes everything; a node can install a stricter filter per interface (e.g. to scope a proxy
/// connection to a subnet).
pub trait Filter {
    fn allow(&self, pdu: &[u8]) -> bool;
}

/// Passes every PDU; the default used when an interface is created without an explicit filter.
#[derive(Debug, Copy, Clone, Default)]
pub struct PassAll;

impl Filter for PassAll {
    fn allow(&self, _pdu: &[u8]) -> bool {
        true
    }
}

/// Per-interface traffic counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub total_rx: u32,
    pub filtered_rx: u32,
    pub total_tx: u32,
    pub filtered_tx: u32,
}

/// Opaque handle to a registered interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IfaceHandle(u8);

struct IfaceEntry<In, Out> {
    handle: IfaceHandle,
    bearer: BearerHandle,
    input_filter: In,
    output_filter: Out,
    counters: Counters,
    is_loopback: bool,
}

/// The loopback interface is always present at handle 0, bound to no real bearer, and never
/// filters traffic (messages addressed to the node's own unicast address are delivered to it
/// directly by the network layer rather than going out over the air).
const LOOPBACK_HANDLE: IfaceHandle = IfaceHandle(0);

/// Owns the set of interfaces a node has bound to its bearers.
pub struct IfaceTable<
    In = PassAll,
    Out = PassAll,
    N: heapless::ArrayLength<IfaceEntry<In, Out>> = DefaultIfaceCapacity,
> where
    In: Filter,
    Out: Filter,
{
    interfaces: Vec<IfaceEntry<In, Out>, N>,
    next_handle: u8,
}

impl<In, Out, N> IfaceTable<In, Out, N>
where
    In: Filter + Default,
    Out: Filter + Default,
    N: heapless::ArrayLength<IfaceEntry<In, Out>>,
{
    /// Creates a table with the always-present loopback interface already registered.
    pub fn new() -> Self {
        let mut interfaces = Vec::new();
        let _ = interfaces.push(IfaceEntry {
            handle: LOOPBACK_HANDLE,
            bearer: BearerHandle::loopback_placeholder(),
            input_filter: In::default(),
            output_filter: Out::default(),
            counters: Counters::default(),
            is_loopback: true,
        });
        IfaceTable {
            interfaces,
            next_handle: 1,
        }
    }

    pub fn loopback(&self) -> IfaceHandle {
        LOOPBACK_HANDLE
    }

    /// Registers a new interface bound to `bearer`, with pass-all filters by default.
    pub fn create(&mut self, bearer: BearerHandle) -> Result<IfaceHandle, Error> {
        let handle = IfaceHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.interfaces
            .push(IfaceEntry {
                handle,
                bearer,
                input_filter: In::default(),
                output_filter: Out::default(),
                counters: Counters::default(),
                is_loopback: false,
            })
            .map_err(|_| Error::Resource)?;
        Ok(handle)
    }

    /// Replaces the input filter installed on an interface.
    pub fn set_input_filter(&mut self, handle: IfaceHandle, filter: In) -> Result<(), Error> {
        self.entry_mut(handle)?.input_filter = filter;
        Ok(())
    }

    /// Replaces the output filter installed on an interface.
    pub fn set_output_filter(&mut self, handle: IfaceHandle, filter: Out) -> Result<(), Error> {
        self.entry_mut(handle)?.output_filter = filter;
        Ok(())
    }

    pub fn delete(&mut self, handle: IfaceHandle) -> Result<(), Error> {
        if handle == LOOPBACK_HANDLE {
            return Err(Error::Inval);
        }
        let pos = self
            .interfaces
            .iter()
            .position(|e| e.handle == handle)
            .ok_or(Error::NotFound)?;
        self.interfaces.swap_remove(pos);
        Ok(())
    }

    fn entry_mut(&mut self, handle: IfaceHandle) -> Result<&mut IfaceEntry<In, Out>, Error> {
        self.interfaces
            .iter_mut()
            .find(|e| e.handle == handle)
            .ok_or(Error::NotFound)
    }

    fn entry(&self, handle: IfaceHandle) -> Result<&IfaceEntry<In, Out>, Error> {
        self.interfaces
            .iter()
            .find(|e| e.handle == handle)
            .ok_or(Error::NotFound)
    }

    /// Applies the input filter and updates RX counters, returning whether the PDU should be
    /// accepted for further processing.
    pub fn admit_rx(&mut self, handle: IfaceHandle, pdu: &[u8]) -> Result<bool, Error> {
        let entry = self.entry_mut(handle)?;
        entry.counters.total_rx = entry.counters.total_rx.wrapping_add(1);
        if entry.input_filter.allow(pdu) {
            Ok(true)
        } else {
            entry.counters.filtered_rx = entry.counters.filtered_rx.wrapping_add(1);
            Ok(false)
        }
    }

    /// Applies the output filter and updates TX counters, returning whether the PDU should be
    /// sent on the bound bearer.
    pub fn admit_tx(&mut self, handle: IfaceHandle, pdu: &[u8]) -> Result<bool, Error> {
        let entry = self.entry_mut(handle)?;
        entry.counters.total_tx = entry.counters.total_tx.wrapping_add(1);
        if entry.output_filter.allow(pdu) {
            Ok(true)
        } else {
            entry.counters.filtered_tx = entry.counters.filtered_tx.wrapping_add(1);
            Ok(false)
        }
    }

    pub fn counters(&self, handle: IfaceHandle) -> Result<Counters, Error> {
        Ok(self.entry(handle)?.counters)
    }

    pub fn bearer_of(&self, handle: IfaceHandle) -> Result<BearerHandle, Error> {
        Ok(self.entry(handle)?.bearer)
    }

    pub fn is_loopback(&self, handle: IfaceHandle) -> bool {
        self.entry(handle).map(|e| e.is_loopback).unwrap_or(false)
    }
}

impl<In, Out, N> Default for IfaceTable<In, Out, N>
where
    In: Filter + Default,
    Out: Filter + Default,
    N: heapless::ArrayLength<IfaceEntry<In, Out>>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;
    impl Filter for DenyAll {
        fn allow(&self, _pdu: &[u8]) -> bool {
            false
        }
    }
    impl Default for DenyAll {
        fn default() -> Self {
            DenyAll
        }
    }

    #[test]
    fn loopback_present_at_construction() {
        let table: IfaceTable = IfaceTable::new();
        assert!(table.is_loopback(table.loopback()));
    }

    #[test]
    fn filtered_rx_increments_on_rejection() {
        let mut table: IfaceTable<DenyAll, PassAll> = IfaceTable::new();
        let bearer = BearerHandle::loopback_placeholder();
        let handle = table.create(bearer).unwrap();
        assert!(!table.admit_rx(handle, &[0x01]).unwrap());
        let counters = table.counters(handle).unwrap();
        assert_eq!(counters.total_rx, 1);
        assert_eq!(counters.filtered_rx, 1);
    }

    #[test]
    fn delete_rejects_loopback() {
        let mut table: IfaceTable = IfaceTable::new();
        assert_eq!(table.delete(table.loopback()), Err(Error::Inval));
    }
}
