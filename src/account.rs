use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};
use crate::keys::{generate_key_pair, KeyPair};

const NAME_CHARSET: &[u8] = b".12345abcdefghijklmnopqrstuvwxyz";
const GENERATED_CHARSET: &[u8] = b"12345abcdefghijklmnopqrstuvwxyz";
const GENERATED_NAME_LEN: usize = 12;

/// A named on-chain identity together with the keys the harness expects it to carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub owner: KeyPair,
    pub active: KeyPair,
    /// RAM purchased for the account at creation, in bytes.
    #[serde(default)]
    pub ram_bytes: u64,
    /// Initial deposit transferred after creation, in minor units.
    #[serde(default)]
    pub staked_deposit: i64,
}

impl Account {
    pub fn new(name: impl Into<String>, owner: KeyPair, active: KeyPair) -> HarnessResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            owner,
            active,
            ram_bytes: 0,
            staked_deposit: 0,
        })
    }

    /// Account whose owner and active authorities share one key pair.
    pub fn with_single_key(name: impl Into<String>, keys: KeyPair) -> HarnessResult<Self> {
        Self::new(name, keys.clone(), keys)
    }

    pub fn rename(&mut self, name: impl Into<String>) -> HarnessResult<()> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        Ok(())
    }

    /// Private keys available for import, owner first, without duplicates.
    pub fn private_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(2);
        for pair in [&self.owner, &self.active] {
            if let Some(key) = pair.private_key.as_deref() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

/// Checks the chain's account name rules: up to twelve characters from
/// `.12345a-z`, optionally followed by a thirteenth from `.12345a-j`, and no
/// trailing dot.
pub fn validate_name(name: &str) -> HarnessResult<()> {
    let invalid = |reason: &str| HarnessError::Config(format!("invalid account name {name:?}: {reason}"));
    if name.is_empty() || name.len() > 13 {
        return Err(invalid("length must be 1-13"));
    }
    for (index, byte) in name.bytes().enumerate() {
        let allowed = if index == 12 {
            matches!(byte, b'.' | b'1'..=b'5' | b'a'..=b'j')
        } else {
            NAME_CHARSET.contains(&byte)
        };
        if !allowed {
            return Err(invalid("contains a character outside the name alphabet"));
        }
    }
    if name.ends_with('.') {
        return Err(invalid("must not end with a dot"));
    }
    Ok(())
}

pub fn random_account_name() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_NAME_LEN)
        .map(|_| GENERATED_CHARSET[rng.gen_range(0..GENERATED_CHARSET.len())] as char)
        .collect()
}

/// Generates `count` accounts with fresh owner and active key pairs and random names.
pub fn generate_accounts(count: usize) -> HarnessResult<Vec<Account>> {
    let mut accounts = Vec::with_capacity(count);
    while accounts.len() < count {
        let name = random_account_name();
        if accounts.iter().any(|account: &Account| account.name == name) {
            continue;
        }
        accounts.push(Account::new(name, generate_key_pair(), generate_key_pair())?);
    }
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_chain_names() {
        for name in ["eosio", "eosio.token", "testera11111", "defproducera", "a", "abcdefghij12j"] {
            validate_name(name).unwrap_or_else(|err| panic!("{name}: {err}"));
        }
    }

    #[test]
    fn rejects_out_of_alphabet_names() {
        for name in ["", "Upper", "has6digit", "trailing.", "abcdefghijklmn", "abcdefghij12z"] {
            assert!(validate_name(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn generated_accounts_are_distinct_and_keyed() {
        let accounts = generate_accounts(5).expect("accounts");
        assert_eq!(accounts.len(), 5);
        for account in &accounts {
            validate_name(&account.name).expect("valid generated name");
            assert_ne!(account.owner.public_key, account.active.public_key);
            assert_eq!(account.private_keys().len(), 2);
        }
    }

    #[test]
    fn shared_keys_are_listed_once() {
        let keys = generate_key_pair();
        let account = Account::with_single_key("currency1111", keys).expect("account");
        assert_eq!(account.private_keys().len(), 1);
    }
}
