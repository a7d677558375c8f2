//! Participant identity resolution and transport addressing.
//!
//! A participant can be referenced by any mix of account id, email and
//! display name. The resolver collapses every reference to one canonical
//! [`IdentityKey`] so that membership, connections and screen-share
//! ownership all agree on who is who:
//!
//! 1. A non-empty email always wins (`email:<normalized>`).
//! 2. Otherwise the reference is enriched from aliases learned earlier in the
//!    session and from the injected [`Directory`].
//! 3. Otherwise the account id (`id:`) and then the display name (`name:`)
//!    are used, and a reference with nothing usable maps to `unknown`.
//!
//! Normalization trims, lowercases, folds common Latin accents and collapses
//! internal whitespace.
//!
//! Transport addresses are derived from keys (`<prefix>-<hex sha256>`) and
//! are unique per key for the lifetime of a session.

use ring::digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Key used when a reference carries no usable field.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Prefix of keys synthesized for unattributable addresses.
const SYNTHETIC_PREFIX: &str = "addr:";

/// Hash bytes kept in a deterministic address (24 hex characters).
const ADDRESS_HASH_BYTES: usize = 12;

/// A loose reference to a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ParticipantRef {
    /// Reference carrying only an email.
    pub fn from_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    /// Reference carrying only an account id.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Reference carrying only a display name.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn normalized_email(&self) -> String {
        self.email.as_deref().map(normalize).unwrap_or_default()
    }

    fn normalized_id(&self) -> String {
        self.id.as_deref().map(normalize).unwrap_or_default()
    }

    fn normalized_name(&self) -> String {
        self.name.as_deref().map(normalize).unwrap_or_default()
    }

    /// Fill missing fields from another reference to the same person.
    fn enriched_with(&self, other: &ParticipantRef) -> ParticipantRef {
        let pick = |mine: &Option<String>, theirs: &Option<String>| match mine {
            Some(value) if !value.trim().is_empty() => Some(value.clone()),
            _ => theirs.clone(),
        };
        ParticipantRef {
            id: pick(&self.id, &other.id),
            email: pick(&self.email, &other.email),
            name: pick(&self.name, &other.name),
        }
    }
}

/// Canonical identity of a participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Wrap an already-canonical key string.
    pub fn from_canonical(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTITY.to_string())
    }

    fn synthetic(address: &TransportAddress) -> Self {
        Self(format!("{SYNTHETIC_PREFIX}{}", address.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTITY
    }

    /// True for keys synthesized from an unattributable address.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_PREFIX)
    }

    /// Minimal reference that resolves back to this key.
    pub fn to_reference(&self) -> Option<ParticipantRef> {
        if let Some(email) = self.0.strip_prefix("email:") {
            Some(ParticipantRef::from_email(email))
        } else if let Some(id) = self.0.strip_prefix("id:") {
            Some(ParticipantRef::from_id(id))
        } else {
            self.0
                .strip_prefix("name:")
                .map(ParticipantRef::from_name)
        }
    }

    fn rank(&self) -> u8 {
        if self.0.starts_with("email:") {
            3
        } else if self.0.starts_with("id:") {
            2
        } else if self.0.starts_with("name:") {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address a participant listens on for incoming calls.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportAddress(String);

impl TransportAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External lookup used to enrich partial references.
pub trait Directory: Send + Sync {
    /// Full entry for a partial reference, if one is known.
    fn lookup(&self, reference: &ParticipantRef) -> Option<ParticipantRef>;
}

/// In-memory directory matching on any shared normalized field.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<ParticipantRef>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<ParticipantRef>) -> Self {
        Self { entries }
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, reference: &ParticipantRef) -> Option<ParticipantRef> {
        let email = reference.normalized_email();
        let id = reference.normalized_id();
        let name = reference.normalized_name();

        self.entries
            .iter()
            .find(|entry| {
                (!email.is_empty() && entry.normalized_email() == email)
                    || (!id.is_empty() && entry.normalized_id() == id)
                    || (!name.is_empty() && entry.normalized_name() == name)
            })
            .cloned()
    }
}

/// Trim, lowercase, fold accents and collapse whitespace.
pub fn normalize(value: &str) -> String {
    let mut folded = String::with_capacity(value.len());
    for c in value.chars().flat_map(char::to_lowercase) {
        match fold_accent(c) {
            Some(replacement) => folded.push_str(replacement),
            None => folded.push(c),
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_accent(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'ç' | 'ć' | 'ĉ' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'ğ' | 'ģ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'ķ' => "k",
        'ł' | 'ľ' | 'ļ' => "l",
        'ñ' | 'ń' | 'ň' | 'ņ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'ŕ' | 'ř' => "r",
        'ś' | 'š' | 'ş' | 'ș' => "s",
        'ť' | 'ţ' | 'ț' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'ß' => "ss",
        'æ' => "ae",
        'œ' => "oe",
        'þ' => "th",
        _ => return None,
    };
    Some(folded)
}

/// Maps references to keys and keys to transport addresses.
pub struct IdentityResolver {
    directory: Arc<dyn Directory>,
    aliases: HashMap<String, IdentityKey>,
    ambiguous_aliases: HashSet<String>,
    /// Keys held by live connections.
    pinned: BTreeSet<IdentityKey>,
    address_prefix: String,
    legacy_prefix: String,
    address_table: BTreeMap<TransportAddress, IdentityKey>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("aliases", &self.aliases.len())
            .field("address_prefix", &self.address_prefix)
            .field("legacy_prefix", &self.legacy_prefix)
            .field("address_table", &self.address_table.len())
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(
        directory: Arc<dyn Directory>,
        address_prefix: impl Into<String>,
        legacy_prefix: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            aliases: HashMap::new(),
            ambiguous_aliases: HashSet::new(),
            pinned: BTreeSet::new(),
            address_prefix: address_prefix.into(),
            legacy_prefix: legacy_prefix.into(),
            address_table: BTreeMap::new(),
        }
    }

    /// Pin the keys of live connections, replacing earlier pins.
    ///
    /// While pinned, a fuller reference to the same participant resolves to
    /// the pinned key and aliases pointing at it are not upgraded.
    pub fn pin(&mut self, keys: impl IntoIterator<Item = IdentityKey>) {
        self.pinned = keys.into_iter().collect();
    }

    /// Canonical key for a reference. Pure with respect to resolver state.
    pub fn resolve(&self, reference: &ParticipantRef) -> IdentityKey {
        let key = self.resolve_unpinned(reference);
        if key.is_unknown() || self.pinned.is_empty() || self.pinned.contains(&key) {
            return key;
        }
        self.pinned_alias(reference)
            .filter(|pinned| pinned.rank() < key.rank())
            .unwrap_or(key)
    }

    fn pinned_alias(&self, reference: &ParticipantRef) -> Option<IdentityKey> {
        [
            alias_for("id", &reference.normalized_id()),
            alias_for("name", &reference.normalized_name()),
        ]
        .into_iter()
        .flatten()
        .filter(|alias| !self.ambiguous_aliases.contains(alias))
        .map(|alias| match self.aliases.get(&alias) {
            Some(key) => key.clone(),
            None => IdentityKey(alias),
        })
        .find(|key| self.pinned.contains(key))
    }

    fn resolve_unpinned(&self, reference: &ParticipantRef) -> IdentityKey {
        let email = reference.normalized_email();
        if !email.is_empty() {
            return IdentityKey(format!("email:{email}"));
        }

        let id = reference.normalized_id();
        let name = reference.normalized_name();

        for alias in [alias_for("id", &id), alias_for("name", &name)]
            .into_iter()
            .flatten()
        {
            if let Some(key) = self.aliases.get(&alias) {
                return key.clone();
            }
        }

        let enriched = match self.directory.lookup(reference) {
            Some(entry) => reference.enriched_with(&entry),
            None => reference.clone(),
        };
        let email = enriched.normalized_email();
        if !email.is_empty() {
            return IdentityKey(format!("email:{email}"));
        }
        let id = enriched.normalized_id();
        if !id.is_empty() {
            return IdentityKey(format!("id:{id}"));
        }
        let name = enriched.normalized_name();
        if !name.is_empty() {
            return IdentityKey(format!("name:{name}"));
        }

        IdentityKey::unknown()
    }

    /// Resolve a reference and remember its weaker fields as aliases.
    pub fn register(&mut self, reference: &ParticipantRef) -> IdentityKey {
        let key = self.resolve(reference);
        if key.is_unknown() {
            return key;
        }

        let enriched = match self.directory.lookup(reference) {
            Some(entry) => reference.enriched_with(&entry),
            None => reference.clone(),
        };
        let candidates = [
            alias_for("id", &enriched.normalized_id()),
            alias_for("name", &enriched.normalized_name()),
        ];
        for alias in candidates.into_iter().flatten() {
            if alias == key.as_str() || self.ambiguous_aliases.contains(&alias) {
                continue;
            }
            match self.aliases.get(&alias) {
                None => {
                    self.aliases.insert(alias, key.clone());
                }
                Some(existing) if existing == &key => {}
                Some(existing) if self.pinned.contains(existing) && existing.rank() < key.rank() => {}
                Some(existing) if existing.rank() < key.rank() => {
                    self.aliases.insert(alias, key.clone());
                }
                Some(existing) if existing.rank() == key.rank() => {
                    debug!(
                        target: "session.identity",
                        alias = %alias,
                        "Alias maps to more than one identity, dropping it"
                    );
                    self.aliases.remove(&alias);
                    self.ambiguous_aliases.insert(alias);
                }
                Some(_) => {}
            }
        }

        key
    }

    /// Deterministic listening address for a key.
    pub fn to_address(&self, key: &IdentityKey) -> TransportAddress {
        let hash = digest::digest(&digest::SHA256, key.as_str().as_bytes());
        let bytes = hash.as_ref();
        let truncated = bytes.get(..ADDRESS_HASH_BYTES).unwrap_or(bytes);
        TransportAddress(format!("{}-{}", self.address_prefix, hex::encode(truncated)))
    }

    /// Address used by clients that still listen on their account id.
    pub fn legacy_address(&self, account_id: &str) -> TransportAddress {
        let slug: String = normalize(account_id)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        TransportAddress(format!("{}-{slug}", self.legacy_prefix))
    }

    fn account_id(&self, key: &IdentityKey, reference: Option<&ParticipantRef>) -> Option<String> {
        if let Some(id) = key.as_str().strip_prefix("id:") {
            return Some(id.to_string());
        }
        let from_reference = reference
            .map(ParticipantRef::normalized_id)
            .filter(|id| !id.is_empty());
        from_reference.or_else(|| {
            let lookup = reference.cloned().or_else(|| key.to_reference())?;
            self.directory
                .lookup(&lookup)
                .map(|entry| entry.normalized_id())
                .filter(|id| !id.is_empty())
        })
    }

    /// Ordered dial candidates: deterministic, legacy, then observed.
    pub fn candidates(
        &self,
        key: &IdentityKey,
        reference: Option<&ParticipantRef>,
        observed: &[TransportAddress],
        max: usize,
    ) -> Vec<TransportAddress> {
        let mut out = vec![self.to_address(key)];
        if let Some(id) = self.account_id(key, reference) {
            out.push(self.legacy_address(&id));
        }
        out.extend(observed.iter().cloned());

        let mut seen = HashSet::new();
        out.retain(|address| seen.insert(address.clone()));
        out.truncate(max.max(1));
        out
    }

    /// Rebuild the address-to-key table from the current membership.
    pub fn rebuild_address_table<'a>(
        &mut self,
        members: impl IntoIterator<Item = (&'a IdentityKey, Option<&'a ParticipantRef>)>,
        observed: &BTreeMap<TransportAddress, IdentityKey>,
    ) {
        let mut table = BTreeMap::new();
        for (key, reference) in members {
            table.insert(self.to_address(key), key.clone());
            if let Some(id) = self.account_id(key, reference) {
                table.entry(self.legacy_address(&id)).or_insert_with(|| key.clone());
            }
        }
        for (address, key) in observed {
            let key = self.canonical(key);
            table.entry(address.clone()).or_insert(key);
        }
        self.address_table = table;
    }

    /// Re-resolve a stored key so weaker keys follow alias upgrades.
    pub fn canonical(&self, key: &IdentityKey) -> IdentityKey {
        key.to_reference()
            .map(|reference| self.resolve(&reference))
            .filter(|resolved| !resolved.is_unknown())
            .unwrap_or_else(|| key.clone())
    }

    /// Key recorded for an address, if any.
    pub fn lookup_address(&self, address: &TransportAddress) -> Option<&IdentityKey> {
        self.address_table.get(address)
    }

    /// Attribute a caller's address to a participant.
    ///
    /// Tries the address table, then the only other participant of a
    /// two-party session, then the first participant without a live
    /// connection, and finally synthesizes `addr:<address>`.
    pub fn from_address(
        &self,
        address: &TransportAddress,
        others: &[IdentityKey],
        is_connected: impl Fn(&IdentityKey) -> bool,
    ) -> IdentityKey {
        if let Some(key) = self.address_table.get(address) {
            return key.clone();
        }

        if let [only] = others {
            debug!(
                target: "session.identity",
                address = %address,
                key = %only,
                "Attributed unknown address to the only other participant"
            );
            return only.clone();
        }

        if let Some(key) = others.iter().find(|key| !is_connected(key)) {
            debug!(
                target: "session.identity",
                address = %address,
                key = %key,
                "Attributed unknown address to an unconnected participant"
            );
            return key.clone();
        }

        debug!(
            target: "session.identity",
            address = %address,
            "Address could not be attributed, using a synthetic key"
        );
        IdentityKey::synthetic(address)
    }
}

fn alias_for(field: &str, value: &str) -> Option<String> {
    (!value.is_empty()).then(|| format!("{field}:{value}"))
}
