// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use num_bigint::BigInt;

use crate::contracts::RoundState;

/// How many fully paid rounds the aggregator must be able to cover before we
/// consider it funded.
pub const MIN_FUNDED_ROUNDS: u32 = 3;

/// Whether the round's payment meets the configured floor. Inclusive.
pub fn sufficient_payment(minimum_contract_payment: &BigInt, payment: &BigInt) -> bool {
    payment >= minimum_contract_payment
}

/// Whether the aggregator can pay every oracle for [`MIN_FUNDED_ROUNDS`]
/// more rounds. Inclusive.
pub fn sufficient_funds(state: &RoundState) -> bool {
    let required = &state.payment_amount * state.oracle_count * MIN_FUNDED_ROUNDS;
    state.available_funds >= required
}
