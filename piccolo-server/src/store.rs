use std::sync::{Mutex, MutexGuard, PoisonError};

use piccolo_protocol::{RegisterValue, Snapshot};

use crate::{
    RegisterMemory,
    error::{ConfigError, RegisterError},
    registers::{BLOCK_LEN, RegisterCatalog},
};

/// Register memory backed by a heap allocation.
///
/// Stands in for the device memory when running without hardware.
#[derive(Debug, Clone)]
pub struct HeapMemory {
    bytes: Vec<u8>,
}

impl HeapMemory {
    pub fn new(size: usize) -> HeapMemory {
        HeapMemory {
            bytes: vec![0; size],
        }
    }
}

impl RegisterMemory for HeapMemory {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn read_block(&self, offset: usize) -> [u8; BLOCK_LEN] {
        let mut block = [0u8; BLOCK_LEN];
        block.copy_from_slice(&self.bytes[offset..offset + BLOCK_LEN]);
        block
    }

    fn write_block(&mut self, offset: usize, block: [u8; BLOCK_LEN]) {
        self.bytes[offset..offset + BLOCK_LEN].copy_from_slice(&block);
    }
}

/// The live register values, accessed only through the rules of a [`RegisterCatalog`].
///
/// Every single register access is atomic with respect to other accesses. There is no
/// atomicity across registers: a [`Snapshot`] taken while another connection writes may
/// contain values from before and after that write.
pub struct RegisterStore<M> {
    catalog: RegisterCatalog,
    memory: Mutex<M>,
}

impl<M: RegisterMemory> RegisterStore<M> {
    /// Fails if a register of `catalog` lies outside of `memory`.
    pub fn new(catalog: RegisterCatalog, memory: M) -> Result<RegisterStore<M>, ConfigError> {
        let size = memory.size();
        if let Some(register) = catalog
            .iter()
            .find(|register| register.address() + BLOCK_LEN > size)
        {
            return Err(ConfigError::OutOfRange {
                name: register.name().to_string(),
                address: register.address(),
                size,
            });
        }
        Ok(RegisterStore {
            catalog,
            memory: Mutex::new(memory),
        })
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    // A panicking writer cannot leave a block half-written, so a poisoned lock is still usable.
    fn memory(&self) -> MutexGuard<'_, M> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Result<RegisterValue, RegisterError> {
        let register = self.catalog.get(name)?;
        let block = self.memory().read_block(register.address());
        let value = register.decode(block);
        log::trace!("Got {} from memory: {}", name, value);
        Ok(value)
    }

    pub fn set(&self, name: &str, value: &RegisterValue) -> Result<(), RegisterError> {
        let register = self.catalog.get(name)?;
        let block = register.encode(value)?;
        self.memory().write_block(register.address(), block);
        log::debug!("Set {} in memory: {}", name, value);
        Ok(())
    }

    /// Writes the declared default of every register that has one.
    pub fn apply_defaults(&self) -> Result<usize, RegisterError> {
        let mut applied = 0;
        for register in self.catalog.iter() {
            if let Some(value) = register.default_value() {
                self.set(register.name(), value)?;
                applied += 1;
            }
        }
        log::info!("Applied {} register defaults", applied);
        Ok(applied)
    }

    /// Reads every register once, in catalog order.
    pub fn snapshot(&self) -> Snapshot {
        self.catalog
            .iter()
            .map(|register| {
                let block = self.memory().read_block(register.address());
                (register.name().to_string(), register.decode(block))
            })
            .collect()
    }
}
