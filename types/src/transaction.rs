// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::{Amount, Script};
use serde::{Deserialize, Serialize};

/// A transaction output as seen by the payment validator.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script: Script,
}

impl TxOut {
    pub fn new(value: Amount, script: Script) -> Self {
        TxOut { value, script }
    }
}

/// The slice of a coinbase/coinstake transaction the tier subsystem cares
/// about: its outputs. Full transaction consensus lives outside this crate.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    pub fn new(outputs: Vec<TxOut>) -> Self {
        Transaction { outputs }
    }

    /// Sum of all output values.
    pub fn total_out(&self) -> Amount {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Whether some output pays `value` to `script` exactly.
    pub fn pays(&self, script: &Script, value: Amount) -> bool {
        self.outputs
            .iter()
            .any(|out| out.script == *script && out.value == value)
    }
}
