use std::collections::BTreeMap;

use crate::error::VmError;

/// Parsed gas cost table: category name -> operation name -> cost.
pub type GasTable = BTreeMap<String, BTreeMap<String, u64>>;

pub const BASE_OPERATION_COST: &str = "BaseOperationCost";
pub const BASE_OPS_API_COST: &str = "BaseOpsAPICost";

/// Gas schedule for host operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSchedule {
    // BaseOperationCost
    pub store_per_byte: u64,
    pub data_copy_per_byte: u64,
    pub compile_per_byte: u64,
    pub aot_prepare_per_byte: u64,
    pub get_code: u64,

    // BaseOpsAPICost
    pub transfer_value: u64,
    pub storage_store: u64,
    pub storage_load: u64,
    pub log: u64,
    pub finish: u64,
    pub execute_on_same_context: u64,
    pub execute_on_dest_context: u64,
    pub async_call_step: u64,
    pub async_callback_gas_lock: u64,
    pub create_async_call: u64,
    pub set_async_group_callback: u64,
    pub set_async_context_callback: u64,
    pub get_callback_closure: u64,
    pub create_contract: u64,
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self {
            store_per_byte: 50,
            data_copy_per_byte: 50,
            compile_per_byte: 300,
            aot_prepare_per_byte: 100,
            get_code: 10_000,

            transfer_value: 100_000,
            storage_store: 75_000,
            storage_load: 50_000,
            log: 3_750,
            finish: 1_000,
            execute_on_same_context: 100_000,
            execute_on_dest_context: 100_000,
            async_call_step: 100_000,
            async_callback_gas_lock: 4_000_000,
            create_async_call: 200_000,
            set_async_group_callback: 100_000,
            set_async_context_callback: 100_000,
            get_callback_closure: 10_000,
            create_contract: 300_000,
        }
    }
}

impl GasSchedule {
    /// Build a schedule from a parsed cost table. Every entry is required.
    pub fn from_table(table: &GasTable) -> Result<Self, VmError> {
        let base = |name: &str| lookup(table, BASE_OPERATION_COST, name);
        let api = |name: &str| lookup(table, BASE_OPS_API_COST, name);

        Ok(Self {
            store_per_byte: base("StorePerByte")?,
            data_copy_per_byte: base("DataCopyPerByte")?,
            compile_per_byte: base("CompilePerByte")?,
            aot_prepare_per_byte: base("AoTPreparePerByte")?,
            get_code: base("GetCode")?,

            transfer_value: api("TransferValue")?,
            storage_store: api("StorageStore")?,
            storage_load: api("StorageLoad")?,
            log: api("Log")?,
            finish: api("Finish")?,
            execute_on_same_context: api("ExecuteOnSameContext")?,
            execute_on_dest_context: api("ExecuteOnDestContext")?,
            async_call_step: api("AsyncCallStep")?,
            async_callback_gas_lock: api("AsyncCallbackGasLock")?,
            create_async_call: api("CreateAsyncCall")?,
            set_async_group_callback: api("SetAsyncGroupCallback")?,
            set_async_context_callback: api("SetAsyncContextCallback")?,
            get_callback_closure: api("GetCallbackClosure")?,
            create_contract: api("CreateContract")?,
        })
    }

    /// Inverse of [`GasSchedule::from_table`].
    pub fn to_table(&self) -> GasTable {
        let base: BTreeMap<String, u64> = [
            ("StorePerByte", self.store_per_byte),
            ("DataCopyPerByte", self.data_copy_per_byte),
            ("CompilePerByte", self.compile_per_byte),
            ("AoTPreparePerByte", self.aot_prepare_per_byte),
            ("GetCode", self.get_code),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let api: BTreeMap<String, u64> = [
            ("TransferValue", self.transfer_value),
            ("StorageStore", self.storage_store),
            ("StorageLoad", self.storage_load),
            ("Log", self.log),
            ("Finish", self.finish),
            ("ExecuteOnSameContext", self.execute_on_same_context),
            ("ExecuteOnDestContext", self.execute_on_dest_context),
            ("AsyncCallStep", self.async_call_step),
            ("AsyncCallbackGasLock", self.async_callback_gas_lock),
            ("CreateAsyncCall", self.create_async_call),
            ("SetAsyncGroupCallback", self.set_async_group_callback),
            ("SetAsyncContextCallback", self.set_async_context_callback),
            ("GetCallbackClosure", self.get_callback_closure),
            ("CreateContract", self.create_contract),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let mut table = GasTable::new();
        table.insert(BASE_OPERATION_COST.to_string(), base);
        table.insert(BASE_OPS_API_COST.to_string(), api);
        table
    }

    /// Schedule where every operation is free. Useful when only the
    /// contract-declared costs should show up in the ledger.
    pub fn zero() -> Self {
        Self {
            store_per_byte: 0,
            data_copy_per_byte: 0,
            compile_per_byte: 0,
            aot_prepare_per_byte: 0,
            get_code: 0,
            transfer_value: 0,
            storage_store: 0,
            storage_load: 0,
            log: 0,
            finish: 0,
            execute_on_same_context: 0,
            execute_on_dest_context: 0,
            async_call_step: 0,
            async_callback_gas_lock: 0,
            create_async_call: 0,
            set_async_group_callback: 0,
            set_async_context_callback: 0,
            get_callback_closure: 0,
            create_contract: 0,
        }
    }

    /// Cost of loading and preparing `code_size` bytes of code.
    pub fn code_load_cost(&self, code_size: u64) -> u64 {
        self.get_code
            .saturating_add(code_size.saturating_mul(self.aot_prepare_per_byte))
    }

    /// Extra gas locked on top of the caller's request whenever a callback
    /// is attached, so the callback frame can at least be loaded.
    pub fn extra_gas_locked_for_async(&self, code_size: u64) -> u64 {
        code_size
            .saturating_mul(self.aot_prepare_per_byte)
            .saturating_add(self.async_call_step)
            .saturating_add(self.async_callback_gas_lock)
    }

    /// Fixed overhead deducted from the gas handed to a callback.
    pub fn callback_overhead(&self, data_len: u64) -> u64 {
        self.async_call_step
            .saturating_add(self.data_copy_per_byte.saturating_mul(data_len))
    }
}

fn lookup(table: &GasTable, category: &str, name: &str) -> Result<u64, VmError> {
    table
        .get(category)
        .and_then(|costs| costs.get(name))
        .copied()
        .ok_or_else(|| VmError::InvalidGasSchedule(format!("missing {}.{}", category, name)))
}

/// Gas accounting for a single call frame.
///
/// `provided == used + remaining + locked` holds after every operation.
/// Running out of gas is recoverable ([`VmError::OutOfGas`]); any attempt to
/// move more gas than a bucket holds is an engine bug
/// ([`VmError::GasLedgerInvariant`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GasLedger {
    provided: u64,
    used: u64,
    locked: u64,
}

impl GasLedger {
    pub fn new(provided: u64) -> Self {
        Self {
            provided,
            used: 0,
            locked: 0,
        }
    }

    pub fn provided(&self) -> u64 {
        self.provided
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn locked(&self) -> u64 {
        self.locked
    }

    pub fn remaining(&self) -> u64 {
        self.provided
            .saturating_sub(self.used)
            .saturating_sub(self.locked)
    }

    /// Largest amount that can be handed to a child asking for `requested`.
    pub fn bound(&self, requested: u64) -> u64 {
        requested.min(self.remaining())
    }

    /// Spend gas.
    pub fn charge(&mut self, amount: u64) -> Result<(), VmError> {
        let remaining = self.remaining();
        if amount > remaining {
            return Err(VmError::OutOfGas {
                requested: amount,
                remaining,
            });
        }
        self.used += amount;
        Ok(())
    }

    /// Reserve gas so ordinary operations cannot spend it.
    pub fn lock(&mut self, amount: u64) -> Result<(), VmError> {
        let remaining = self.remaining();
        if amount > remaining {
            return Err(VmError::OutOfGas {
                requested: amount,
                remaining,
            });
        }
        self.locked += amount;
        tracing::trace!(target: "strata::gas", amount, locked = self.locked, "gas locked");
        Ok(())
    }

    /// Release previously locked gas back into `remaining`.
    pub fn unlock(&mut self, amount: u64) -> Result<(), VmError> {
        self.locked = self.locked.checked_sub(amount).ok_or_else(|| {
            VmError::GasLedgerInvariant(format!(
                "unlock {} exceeds locked {}",
                amount, self.locked
            ))
        })?;
        tracing::trace!(target: "strata::gas", amount, locked = self.locked, "gas unlocked");
        Ok(())
    }

    /// Carry unused gas of a completed child back to this frame.
    pub fn restore(&mut self, amount: u64) -> Result<(), VmError> {
        self.used = self.used.checked_sub(amount).ok_or_else(|| {
            VmError::GasLedgerInvariant(format!(
                "restore {} exceeds used {}",
                amount, self.used
            ))
        })?;
        Ok(())
    }

    /// Move locked gas out of this frame for good (escrow or a transfer).
    pub fn spend_locked(&mut self, amount: u64) -> Result<(), VmError> {
        self.unlock(amount)?;
        self.used += amount;
        Ok(())
    }

    /// Add gas that was escrowed by an earlier round.
    pub fn credit(&mut self, amount: u64) -> Result<(), VmError> {
        self.provided = self.provided.checked_add(amount).ok_or_else(|| {
            VmError::GasLedgerInvariant(format!(
                "credit {} overflows provided {}",
                amount, self.provided
            ))
        })?;
        Ok(())
    }

    /// Burn everything that is still spendable; used when a frame fails.
    pub fn consume_all(&mut self) {
        self.used += self.remaining();
    }

    /// Verify the conservation invariant.
    pub fn check(&self) -> Result<(), VmError> {
        match self.used.checked_add(self.locked) {
            Some(total) if total <= self.provided => Ok(()),
            _ => Err(VmError::GasLedgerInvariant(format!(
                "provided {} < used {} + locked {}",
                self.provided, self.used, self.locked
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gas_ledger() {
        let mut ledger = GasLedger::new(100_000);
        assert_eq!(ledger.provided(), 100_000);
        assert_eq!(ledger.remaining(), 100_000);

        ledger.charge(10_000).unwrap();
        assert_eq!(ledger.used(), 10_000);
        assert_eq!(ledger.remaining(), 90_000);
    }

    #[test]
    fn test_out_of_gas() {
        let mut ledger = GasLedger::new(1_000);
        let err = ledger.charge(10_000).unwrap_err();
        assert_eq!(err, VmError::OutOfGas { requested: 10_000, remaining: 1_000 });
        assert!(!err.is_fatal());
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut ledger = GasLedger::new(1_000);
        ledger.lock(150).unwrap();
        assert_eq!(ledger.remaining(), 850);
        assert_eq!(ledger.locked(), 150);

        // locked gas is not spendable
        assert!(ledger.charge(900).is_err());

        ledger.unlock(150).unwrap();
        assert_eq!(ledger.remaining(), 1_000);
        assert_eq!(ledger.locked(), 0);
    }

    #[test]
    fn test_lock_more_than_remaining() {
        let mut ledger = GasLedger::new(100);
        ledger.charge(60).unwrap();
        assert!(matches!(ledger.lock(50), Err(VmError::OutOfGas { .. })));
    }

    #[test]
    fn test_unlock_underflow_is_fatal() {
        let mut ledger = GasLedger::new(100);
        ledger.lock(10).unwrap();
        let err = ledger.unlock(11).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.locked(), 10);
    }

    #[test]
    fn test_restore_carries_child_gas_forward() {
        let mut ledger = GasLedger::new(1_000);
        ledger.charge(300).unwrap(); // forwarded to child
        ledger.restore(100).unwrap(); // child returned 100
        assert_eq!(ledger.used(), 200);
        assert_eq!(ledger.remaining(), 800);
        assert!(ledger.restore(201).unwrap_err().is_fatal());
    }

    #[test]
    fn test_spend_locked_and_credit() {
        let mut ledger = GasLedger::new(500);
        ledger.lock(200).unwrap();
        ledger.spend_locked(200).unwrap();
        assert_eq!(ledger.used(), 200);
        assert_eq!(ledger.locked(), 0);

        ledger.credit(50).unwrap();
        assert_eq!(ledger.provided(), 550);
        assert_eq!(ledger.remaining(), 350);
        assert!(ledger.credit(u64::MAX).unwrap_err().is_fatal());
    }

    #[test]
    fn test_consume_all_keeps_locked() {
        let mut ledger = GasLedger::new(500);
        ledger.lock(100).unwrap();
        ledger.consume_all();
        assert_eq!(ledger.remaining(), 0);
        assert_eq!(ledger.used(), 400);
        assert_eq!(ledger.locked(), 100);
    }

    #[test]
    fn test_schedule_table_roundtrip() {
        let schedule = GasSchedule::default();
        let table = schedule.to_table();
        assert_eq!(table[BASE_OPS_API_COST]["AsyncCallStep"], schedule.async_call_step);
        assert_eq!(GasSchedule::from_table(&table).unwrap(), schedule);
    }

    #[test]
    fn test_schedule_missing_entry() {
        let mut table = GasSchedule::default().to_table();
        table
            .get_mut(BASE_OPS_API_COST)
            .unwrap()
            .remove("AsyncCallbackGasLock");
        let err = GasSchedule::from_table(&table).unwrap_err();
        assert_eq!(
            err,
            VmError::InvalidGasSchedule("missing BaseOpsAPICost.AsyncCallbackGasLock".to_string())
        );
    }

    #[test]
    fn test_extra_gas_locked_for_async() {
        let schedule = GasSchedule {
            aot_prepare_per_byte: 2,
            async_call_step: 10,
            async_callback_gas_lock: 150,
            ..GasSchedule::zero()
        };
        assert_eq!(schedule.extra_gas_locked_for_async(100), 200 + 10 + 150);
        assert_eq!(schedule.callback_overhead(7), 10);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Charge(u64),
        Lock(u64),
        Unlock(u64),
        Restore(u64),
        SpendLocked(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..400).prop_map(Op::Charge),
            (0u64..400).prop_map(Op::Lock),
            (0u64..400).prop_map(Op::Unlock),
            (0u64..400).prop_map(Op::Restore),
            (0u64..400).prop_map(Op::SpendLocked),
        ]
    }

    proptest! {
        #[test]
        fn prop_conservation_holds(provided in 0u64..2_000, ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut ledger = GasLedger::new(provided);
            for op in ops {
                let _ = match op {
                    Op::Charge(n) => ledger.charge(n),
                    Op::Lock(n) => ledger.lock(n),
                    Op::Unlock(n) => ledger.unlock(n),
                    Op::Restore(n) => ledger.restore(n),
                    Op::SpendLocked(n) => ledger.spend_locked(n),
                };
                prop_assert!(ledger.check().is_ok());
                prop_assert_eq!(
                    ledger.provided(),
                    ledger.used() + ledger.remaining() + ledger.locked()
                );
            }
        }
    }
}
