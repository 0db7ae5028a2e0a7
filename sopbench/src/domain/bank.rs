//! Reference `bank` domain: an in-memory account store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Domain, DomainBackend, HelperSpec};
use crate::core::descriptor::DomainDescriptor;
use crate::error::SopError;

const DESCRIPTOR: &str = include_str!("bank.json");

/// Deposit ceiling used when a task does not set `maximum_deposit`.
pub const DEFAULT_MAXIMUM_DEPOSIT: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub identification: String,
    pub admin_password: String,
    pub security_answer: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub loans: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankDatabase {
    pub accounts: BTreeMap<String, Account>,
    pub logged_in_users: BTreeSet<String>,
    pub authenticated_users: BTreeSet<String>,
    pub verified_users: BTreeSet<String>,
}

impl BankDatabase {
    /// Two customers with known credentials, nobody logged in.
    pub fn sample() -> Self {
        let account = |id: &str, password: &str, answer: &str, balance: f64, loans: f64| Account {
            identification: id.to_string(),
            admin_password: password.to_string(),
            security_answer: answer.to_string(),
            balance,
            loans,
        };
        Self {
            accounts: BTreeMap::from([
                ("alice".to_string(), account("id-a", "pw-a", "blue", 500.0, 0.0)),
                ("bob".to_string(), account("id-b", "pw-b", "green", 0.0, 250.0)),
            ]),
            ..Self::default()
        }
    }
}

pub struct BankDomain {
    descriptor: DomainDescriptor,
}

impl BankDomain {
    pub fn new() -> Result<Self, SopError> {
        Ok(Self {
            descriptor: DomainDescriptor::from_json(DESCRIPTOR)?,
        })
    }
}

impl Domain for BankDomain {
    fn descriptor(&self) -> &DomainDescriptor {
        &self.descriptor
    }

    fn backend(&self, initial_database: Option<&Value>) -> Result<Box<dyn DomainBackend>, SopError> {
        let db = match initial_database {
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                SopError::GenerationFormat(format!("bank database does not parse: {err}"))
            })?,
            None => BankDatabase::sample(),
        };
        Ok(Box::new(BankBackend { db }))
    }

    fn default_database(&self) -> Value {
        serde_json::to_value(BankDatabase::sample()).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct BankBackend {
    db: BankDatabase,
}

fn string_arg<'a>(tool: &str, args: &'a Map<String, Value>, key: &str) -> Result<&'a str, SopError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SopError::tool_call(tool, format!("argument {key} must be a string")))
}

/// Amounts arrive as numbers or numeric strings depending on the agent.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number_arg(tool: &str, args: &Map<String, Value>, key: &str) -> Result<f64, SopError> {
    number(args.get(key)).ok_or_else(|| SopError::tool_call(tool, format!("argument {key} must be a number")))
}

impl BankBackend {
    fn account(&self, username: Option<&str>) -> Option<&Account> {
        username.and_then(|u| self.db.accounts.get(u))
    }
}

impl DomainBackend for BankBackend {
    fn database(&self) -> Value {
        serde_json::to_value(&self.db).unwrap_or(Value::Null)
    }

    fn check_predicate(
        &self,
        name: &str,
        args: &Map<String, Value>,
        constraint_parameters: &Map<String, Value>,
    ) -> Result<bool, SopError> {
        let username = args.get("username").and_then(Value::as_str);
        let amount = number(args.get("amount"));
        let holds = match name {
            "internal_check_username_exist" => self.account(username).is_some(),
            "logged_in_user" => username.is_some_and(|u| self.db.logged_in_users.contains(u)),
            "authenticated_admin_password" => {
                username.is_some_and(|u| self.db.authenticated_users.contains(u))
            }
            "verified_security_answer" => username.is_some_and(|u| self.db.verified_users.contains(u)),
            "sufficient_account_balance" => match (self.account(username), amount) {
                (Some(account), Some(amount)) => account.balance >= amount,
                _ => false,
            },
            "amount_positive" => amount.is_some_and(|a| a > 0.0),
            "within_deposit_limit" => {
                let limit = number(constraint_parameters.get("maximum_deposit"))
                    .unwrap_or(DEFAULT_MAXIMUM_DEPOSIT);
                amount.is_some_and(|a| a <= limit)
            }
            "no_outstanding_loans" => self.account(username).is_some_and(|a| a.loans <= 0.0),
            other => return Err(SopError::UnknownPredicate(other.to_string())),
        };
        Ok(holds)
    }

    fn perform(&mut self, action: &str, args: &Map<String, Value>) -> Result<Value, SopError> {
        let db = &mut self.db;
        let result = match action {
            "login_user" => {
                let username = string_arg(action, args, "username")?;
                let identification = string_arg(action, args, "identification")?;
                let matches = db
                    .accounts
                    .get(username)
                    .is_some_and(|a| a.identification == identification);
                if matches {
                    db.logged_in_users.insert(username.to_string());
                }
                json!(matches)
            }
            "logout_user" => {
                let username = string_arg(action, args, "username")?;
                db.authenticated_users.remove(username);
                db.verified_users.remove(username);
                json!(db.logged_in_users.remove(username))
            }
            "authenticate_admin_password" => {
                let username = string_arg(action, args, "username")?;
                let password = string_arg(action, args, "admin_password")?;
                let matches = db
                    .accounts
                    .get(username)
                    .is_some_and(|a| a.admin_password == password);
                if matches {
                    db.authenticated_users.insert(username.to_string());
                }
                json!(matches)
            }
            "verify_security_answer" => {
                let username = string_arg(action, args, "username")?;
                let answer = string_arg(action, args, "security_answer")?;
                let matches = db
                    .accounts
                    .get(username)
                    .is_some_and(|a| a.security_answer == answer);
                if matches {
                    db.verified_users.insert(username.to_string());
                }
                json!(matches)
            }
            "get_account_balance" => {
                let username = string_arg(action, args, "username")?;
                db.accounts
                    .get(username)
                    .map_or(Value::Bool(false), |a| json!(a.balance))
            }
            "get_loans" => {
                let username = string_arg(action, args, "username")?;
                db.accounts
                    .get(username)
                    .map_or(Value::Bool(false), |a| json!(a.loans))
            }
            "transfer_funds" => {
                let from = string_arg(action, args, "username")?.to_string();
                let to = string_arg(action, args, "destination_username")?.to_string();
                let amount = number_arg(action, args, "amount")?;
                if !db.accounts.contains_key(&from) || !db.accounts.contains_key(&to) {
                    return Ok(json!(false));
                }
                if let Some(source) = db.accounts.get_mut(&from) {
                    source.balance -= amount;
                }
                if let Some(target) = db.accounts.get_mut(&to) {
                    target.balance += amount;
                }
                json!(true)
            }
            "deposit_funds" => {
                let username = string_arg(action, args, "username")?;
                let amount = number_arg(action, args, "amount")?;
                match db.accounts.get_mut(username) {
                    Some(account) => {
                        account.balance += amount;
                        json!(true)
                    }
                    None => json!(false),
                }
            }
            "close_account" => {
                let username = string_arg(action, args, "username")?;
                db.logged_in_users.remove(username);
                db.authenticated_users.remove(username);
                db.verified_users.remove(username);
                json!(db.accounts.remove(username).is_some())
            }
            other => return Err(SopError::tool_call(other, "unknown bank action")),
        };
        Ok(result)
    }

    fn helper(&self, name: &str, args: &Map<String, Value>) -> Option<Result<Value, SopError>> {
        let result = match name {
            "internal_check_username_exist" => string_arg(name, args, "username")
                .map(|u| json!(self.db.accounts.contains_key(u))),
            "internal_get_user" => string_arg(name, args, "username").map(|u| {
                self.db
                    .accounts
                    .get(u)
                    .and_then(|a| serde_json::to_value(a).ok())
                    .unwrap_or(Value::Null)
            }),
            _ => return None,
        };
        Some(result)
    }

    fn helpers(&self) -> Vec<HelperSpec> {
        let helper = |name: &str, description: &str| HelperSpec {
            name: name.to_string(),
            parameters: vec!["username".to_string()],
            description: description.to_string(),
        };
        vec![
            helper("internal_check_username_exist", "Whether an account exists for the username."),
            helper("internal_get_user", "The stored account record of a username, or null."),
        ]
    }

    fn clone_box(&self) -> Box<dyn DomainBackend> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn descriptor_loads_and_validates() {
        let domain = BankDomain::new().unwrap();
        let descriptor = domain.descriptor();
        assert_eq!(descriptor.name, "bank");
        assert_eq!(descriptor.list_actions().len(), 9);
        assert!(descriptor.link("logged_in_user").is_some());
        assert!(descriptor.process("no_outstanding_loans").is_some());
        assert!(descriptor.process("sufficient_account_balance").is_none());
    }

    #[test]
    fn login_requires_matching_identification() {
        let mut backend = BankBackend { db: BankDatabase::sample() };
        let wrong = backend
            .perform("login_user", &args(&[("username", json!("alice")), ("identification", json!("nope"))]))
            .unwrap();
        assert_eq!(wrong, json!(false));
        let right = backend
            .perform("login_user", &args(&[("username", json!("alice")), ("identification", json!("id-a"))]))
            .unwrap();
        assert_eq!(right, json!(true));
        assert!(
            backend
                .check_predicate("logged_in_user", &args(&[("username", json!("alice"))]), &Map::new())
                .unwrap()
        );
    }

    #[test]
    fn transfer_moves_money() {
        let mut backend = BankBackend { db: BankDatabase::sample() };
        let done = backend
            .perform(
                "transfer_funds",
                &args(&[
                    ("username", json!("alice")),
                    ("destination_username", json!("bob")),
                    ("amount", json!("50")),
                ]),
            )
            .unwrap();
        assert_eq!(done, json!(true));
        assert_eq!(backend.db.accounts["alice"].balance, 450.0);
        assert_eq!(backend.db.accounts["bob"].balance, 50.0);
    }

    #[test]
    fn deposit_limit_reads_constraint_parameters() {
        let backend = BankBackend { db: BankDatabase::sample() };
        let params = args(&[("maximum_deposit", json!(100))]);
        let within = |amount: Value| {
            backend
                .check_predicate("within_deposit_limit", &args(&[("amount", amount)]), &params)
                .unwrap()
        };
        assert!(within(json!(100)));
        assert!(!within(json!(101)));
    }

    #[test]
    fn unknown_predicate_is_an_error() {
        let backend = BankBackend { db: BankDatabase::sample() };
        let err = backend
            .check_predicate("is_vip", &Map::new(), &Map::new())
            .unwrap_err();
        assert_eq!(err, SopError::UnknownPredicate("is_vip".to_string()));
    }

    #[test]
    fn helpers_are_read_only() {
        let backend = BankBackend { db: BankDatabase::sample() };
        let before = backend.database();
        let user = backend
            .helper("internal_get_user", &args(&[("username", json!("bob"))]))
            .unwrap()
            .unwrap();
        assert_eq!(user["loans"], json!(250.0));
        assert_eq!(backend.database(), before);
        assert!(backend.helper("transfer_funds", &Map::new()).is_none());
    }
}
