//! Persistence capability.
//!
//! Protocol modules only see the [`Store`] trait. "Not found" is a distinct
//! condition ([`DbError::NotFound`]) that callers must handle explicitly.
//! [`MemoryStore`] is the in-process implementation used by the daemon and
//! the tests.

use crate::model::{
    Authority, Client, Credential, HistoryEntry, Id, LocalAccount, LocalAgent, Owner,
    RemoteAccount, RemoteAgent, Rule, RuleAccess, Transfer,
};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("database failure: {0}")]
    Internal(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;

pub trait Store: Send + Sync {
    fn local_agent(&self, id: Id) -> DbResult<LocalAgent>;
    fn local_agent_by_name(&self, name: &str) -> DbResult<LocalAgent>;
    fn local_account(&self, agent_id: Id, login: &str) -> DbResult<LocalAccount>;
    fn local_account_by_id(&self, id: Id) -> DbResult<LocalAccount>;
    fn local_accounts(&self, agent_id: Id) -> DbResult<Vec<LocalAccount>>;
    fn remote_agent(&self, id: Id) -> DbResult<RemoteAgent>;
    fn remote_agent_by_name(&self, name: &str) -> DbResult<RemoteAgent>;
    fn remote_account(&self, agent_id: Id, login: &str) -> DbResult<RemoteAccount>;
    fn remote_account_by_id(&self, id: Id) -> DbResult<RemoteAccount>;
    fn client(&self, id: Id) -> DbResult<Client>;
    fn client_by_name(&self, name: &str) -> DbResult<Client>;
    fn credentials(&self, owner: Owner) -> DbResult<Vec<Credential>>;
    fn authorities(&self) -> DbResult<Vec<Authority>>;
    fn rule(&self, name: &str, is_send: bool) -> DbResult<Rule>;
    fn rule_by_id(&self, id: Id) -> DbResult<Rule>;
    fn rule_accesses(&self, rule_id: Id) -> DbResult<Vec<RuleAccess>>;
    /// Inserts a transfer, assigning its id.
    fn insert_transfer(&self, transfer: &mut Transfer) -> DbResult<()>;
    fn update_transfer(&self, transfer: &Transfer) -> DbResult<()>;
    fn transfer(&self, id: Id) -> DbResult<Transfer>;
    /// Finds a live server transfer by the peer-assigned id and the account.
    fn server_transfer(&self, remote_id: &str, account_id: Id) -> DbResult<Transfer>;
    fn delete_transfer(&self, id: Id) -> DbResult<()>;
    fn transfers(&self) -> DbResult<Vec<Transfer>>;
    fn insert_history(&self, entry: &HistoryEntry) -> DbResult<()>;
    fn history(&self, id: Id) -> DbResult<HistoryEntry>;
    fn server_history(&self, remote_id: &str, account: &str, agent: &str) -> DbResult<HistoryEntry>;
}

/// Seed data for [`MemoryStore`], as found in the gateway configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Seed {
    pub local_agents: Vec<LocalAgent>,
    pub local_accounts: Vec<LocalAccount>,
    pub remote_agents: Vec<RemoteAgent>,
    pub remote_accounts: Vec<RemoteAccount>,
    pub clients: Vec<Client>,
    pub credentials: Vec<Credential>,
    pub authorities: Vec<Authority>,
    pub rules: Vec<Rule>,
    pub rule_accesses: Vec<RuleAccess>,
}

#[derive(Debug, Default)]
struct Tables {
    seed: Seed,
    transfers: Vec<Transfer>,
    history: Vec<HistoryEntry>,
    next_id: Id,
}

impl Tables {
    fn assign(&mut self, id: &mut Id) {
        if *id == 0 {
            self.next_id += 1;
            *id = self.next_id;
        } else {
            self.next_id = self.next_id.max(*id);
        }
    }
}

/// In-memory [`Store`] behind a single mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn find<T: Clone>(items: &[T], what: &'static str, pred: impl Fn(&T) -> bool) -> DbResult<T> {
    items
        .iter()
        .find(|item| pred(item))
        .cloned()
        .ok_or(DbError::NotFound(what))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from seed data, assigning ids to records that have none.
    pub fn with_seed(seed: Seed) -> Self {
        let store = Self::new();
        {
            let mut tables = store.lock();
            for agent in seed.local_agents {
                tables.push_local_agent(agent);
            }
            for account in seed.local_accounts {
                tables.push_local_account(account);
            }
            for agent in seed.remote_agents {
                tables.push_remote_agent(agent);
            }
            for account in seed.remote_accounts {
                tables.push_remote_account(account);
            }
            for client in seed.clients {
                tables.push_client(client);
            }
            for cred in seed.credentials {
                tables.push_credential(cred);
            }
            for authority in seed.authorities {
                tables.push_authority(authority);
            }
            for rule in seed.rules {
                tables.push_rule(rule);
            }
            tables.seed.rule_accesses.extend(seed.rule_accesses);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_local_agent(&self, agent: LocalAgent) -> Id {
        self.lock().push_local_agent(agent)
    }

    pub fn add_local_account(&self, account: LocalAccount) -> Id {
        self.lock().push_local_account(account)
    }

    pub fn add_remote_agent(&self, agent: RemoteAgent) -> Id {
        self.lock().push_remote_agent(agent)
    }

    pub fn add_remote_account(&self, account: RemoteAccount) -> Id {
        self.lock().push_remote_account(account)
    }

    pub fn add_client(&self, client: Client) -> Id {
        self.lock().push_client(client)
    }

    pub fn add_credential(&self, cred: Credential) -> Id {
        self.lock().push_credential(cred)
    }

    pub fn add_authority(&self, authority: Authority) -> Id {
        self.lock().push_authority(authority)
    }

    pub fn add_rule(&self, rule: Rule) -> Id {
        self.lock().push_rule(rule)
    }

    pub fn add_rule_access(&self, access: RuleAccess) {
        self.lock().seed.rule_accesses.push(access);
    }
}

impl Tables {
    fn push_local_agent(&mut self, mut agent: LocalAgent) -> Id {
        self.assign(&mut agent.id);
        let id = agent.id;
        self.seed.local_agents.push(agent);
        id
    }

    fn push_local_account(&mut self, mut account: LocalAccount) -> Id {
        self.assign(&mut account.id);
        let id = account.id;
        self.seed.local_accounts.push(account);
        id
    }

    fn push_remote_agent(&mut self, mut agent: RemoteAgent) -> Id {
        self.assign(&mut agent.id);
        let id = agent.id;
        self.seed.remote_agents.push(agent);
        id
    }

    fn push_remote_account(&mut self, mut account: RemoteAccount) -> Id {
        self.assign(&mut account.id);
        let id = account.id;
        self.seed.remote_accounts.push(account);
        id
    }

    fn push_client(&mut self, mut client: Client) -> Id {
        self.assign(&mut client.id);
        let id = client.id;
        self.seed.clients.push(client);
        id
    }

    fn push_credential(&mut self, mut cred: Credential) -> Id {
        self.assign(&mut cred.id);
        let id = cred.id;
        self.seed.credentials.push(cred);
        id
    }

    fn push_authority(&mut self, mut authority: Authority) -> Id {
        self.assign(&mut authority.id);
        let id = authority.id;
        self.seed.authorities.push(authority);
        id
    }

    fn push_rule(&mut self, mut rule: Rule) -> Id {
        self.assign(&mut rule.id);
        let id = rule.id;
        self.seed.rules.push(rule);
        id
    }
}

impl Store for MemoryStore {
    fn local_agent(&self, id: Id) -> DbResult<LocalAgent> {
        find(&self.lock().seed.local_agents, "local agent", |a| a.id == id)
    }

    fn local_agent_by_name(&self, name: &str) -> DbResult<LocalAgent> {
        find(&self.lock().seed.local_agents, "local agent", |a| a.name == name)
    }

    fn local_account(&self, agent_id: Id, login: &str) -> DbResult<LocalAccount> {
        find(&self.lock().seed.local_accounts, "local account", |a| {
            a.local_agent_id == agent_id && a.login == login
        })
    }

    fn local_account_by_id(&self, id: Id) -> DbResult<LocalAccount> {
        find(&self.lock().seed.local_accounts, "local account", |a| a.id == id)
    }

    fn local_accounts(&self, agent_id: Id) -> DbResult<Vec<LocalAccount>> {
        Ok(self
            .lock()
            .seed
            .local_accounts
            .iter()
            .filter(|a| a.local_agent_id == agent_id)
            .cloned()
            .collect())
    }

    fn remote_agent(&self, id: Id) -> DbResult<RemoteAgent> {
        find(&self.lock().seed.remote_agents, "partner", |a| a.id == id)
    }

    fn remote_agent_by_name(&self, name: &str) -> DbResult<RemoteAgent> {
        find(&self.lock().seed.remote_agents, "partner", |a| a.name == name)
    }

    fn remote_account(&self, agent_id: Id, login: &str) -> DbResult<RemoteAccount> {
        find(&self.lock().seed.remote_accounts, "remote account", |a| {
            a.remote_agent_id == agent_id && a.login == login
        })
    }

    fn remote_account_by_id(&self, id: Id) -> DbResult<RemoteAccount> {
        find(&self.lock().seed.remote_accounts, "remote account", |a| a.id == id)
    }

    fn client(&self, id: Id) -> DbResult<Client> {
        find(&self.lock().seed.clients, "client", |c| c.id == id)
    }

    fn client_by_name(&self, name: &str) -> DbResult<Client> {
        find(&self.lock().seed.clients, "client", |c| c.name == name)
    }

    fn credentials(&self, owner: Owner) -> DbResult<Vec<Credential>> {
        Ok(self
            .lock()
            .seed
            .credentials
            .iter()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect())
    }

    fn authorities(&self) -> DbResult<Vec<Authority>> {
        Ok(self.lock().seed.authorities.clone())
    }

    fn rule(&self, name: &str, is_send: bool) -> DbResult<Rule> {
        find(&self.lock().seed.rules, "rule", |r| {
            r.name == name && r.is_send == is_send
        })
    }

    fn rule_by_id(&self, id: Id) -> DbResult<Rule> {
        find(&self.lock().seed.rules, "rule", |r| r.id == id)
    }

    fn rule_accesses(&self, rule_id: Id) -> DbResult<Vec<RuleAccess>> {
        Ok(self
            .lock()
            .seed
            .rule_accesses
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect())
    }

    fn insert_transfer(&self, transfer: &mut Transfer) -> DbResult<()> {
        let mut tables = self.lock();
        if transfer.id != 0 && tables.transfers.iter().any(|t| t.id == transfer.id) {
            return Err(DbError::Conflict("transfer"));
        }
        tables.assign(&mut transfer.id);
        tables.transfers.push(transfer.clone());
        Ok(())
    }

    fn update_transfer(&self, transfer: &Transfer) -> DbResult<()> {
        let mut tables = self.lock();
        let slot = tables
            .transfers
            .iter_mut()
            .find(|t| t.id == transfer.id)
            .ok_or(DbError::NotFound("transfer"))?;
        *slot = transfer.clone();
        Ok(())
    }

    fn transfer(&self, id: Id) -> DbResult<Transfer> {
        find(&self.lock().transfers, "transfer", |t| t.id == id)
    }

    fn server_transfer(&self, remote_id: &str, account_id: Id) -> DbResult<Transfer> {
        find(&self.lock().transfers, "transfer", |t| {
            t.is_server && t.remote_transfer_id == remote_id && t.local_account_id == Some(account_id)
        })
    }

    fn delete_transfer(&self, id: Id) -> DbResult<()> {
        let mut tables = self.lock();
        let before = tables.transfers.len();
        tables.transfers.retain(|t| t.id != id);
        if tables.transfers.len() == before {
            return Err(DbError::NotFound("transfer"));
        }
        Ok(())
    }

    fn transfers(&self) -> DbResult<Vec<Transfer>> {
        Ok(self.lock().transfers.clone())
    }

    fn insert_history(&self, entry: &HistoryEntry) -> DbResult<()> {
        let mut tables = self.lock();
        if tables.history.iter().any(|h| h.id == entry.id) {
            return Err(DbError::Conflict("history entry"));
        }
        tables.history.push(entry.clone());
        Ok(())
    }

    fn history(&self, id: Id) -> DbResult<HistoryEntry> {
        find(&self.lock().history, "history entry", |h| h.id == id)
    }

    fn server_history(&self, remote_id: &str, account: &str, agent: &str) -> DbResult<HistoryEntry> {
        find(&self.lock().history, "history entry", |h| {
            h.is_server && h.remote_transfer_id == remote_id && h.account == account && h.agent == agent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CredentialType;

    #[test]
    fn not_found_is_distinguished() {
        let store = MemoryStore::new();
        let err = store.local_agent_by_name("nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(!DbError::Internal("x".into()).is_not_found());
    }

    #[test]
    fn seed_assigns_ids() {
        let seed: Seed = serde_json::from_str(
            r#"{
                "localAgents": [{"name": "r66_server", "protocol": "r66", "address": "127.0.0.1:6666"}],
                "localAccounts": [{"localAgentId": 1, "login": "toto"}],
                "credentials": [{"owner": {"type": "localAccount", "id": 2}, "type": "password_hash", "value": "h"}]
            }"#,
        )
        .unwrap();
        let store = MemoryStore::with_seed(seed);
        let agent = store.local_agent_by_name("r66_server").unwrap();
        assert_eq!(agent.id, 1);
        let account = store.local_account(agent.id, "toto").unwrap();
        assert_eq!(account.id, 2);
        let creds = store.credentials(Owner::LocalAccount(account.id)).unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].kind, CredentialType::PasswordHash);
    }

    #[test]
    fn transfer_lifecycle() {
        let store = MemoryStore::new();
        let mut trans = Transfer::new_server("1234".into(), 1, 7);
        store.insert_transfer(&mut trans).unwrap();
        assert_ne!(trans.id, 0);
        trans.progress = 42;
        store.update_transfer(&trans).unwrap();
        assert_eq!(store.server_transfer("1234", 7).unwrap().progress, 42);
        assert!(store.server_transfer("1234", 8).unwrap_err().is_not_found());
        store.delete_transfer(trans.id).unwrap();
        assert!(store.transfer(trans.id).unwrap_err().is_not_found());
    }
}
