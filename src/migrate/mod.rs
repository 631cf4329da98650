//! Schema migrations
//!
//! Migration files are named `<version>-<description>.sql`. Each file holds
//! the apply SQL, then a line starting with `-- down` (any case), then the
//! revert SQL. The crate's own migrations are compiled in (see [`embedded`]).

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

const EMBEDDED: &[(&str, &str)] = &[
    (
        "0001-create-shard-reservations.sql",
        include_str!("../../migrations/0001-create-shard-reservations.sql"),
    ),
    (
        "0002-reshard-function.sql",
        include_str!("../../migrations/0002-reshard-function.sql"),
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// File name, also the ledger key
    pub name: String,
    pub version: u64,
    pub up: String,
    pub down: String,
}

impl Migration {
    /// Parse a migration file's contents
    pub fn parse(name: &str, text: &str) -> Result<Self> {
        let version = version_of(name)
            .ok_or_else(|| Error::Migration(format!("{}: not a migration file name", name)))?;

        // Sections between marker lines; anything after a second marker is ignored.
        let mut sections = Vec::with_capacity(2);
        let mut start = 0;
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            if is_down_marker(line) {
                sections.push(&text[start..offset]);
                start = offset + line.len();
            }
            offset += line.len();
        }
        sections.push(&text[start..]);
        let up = sections[0].trim();
        let down = sections.get(1).map_or("", |s| s.trim());

        if up.is_empty() {
            return Err(Error::Migration(format!("{}: up SQL not found", name)));
        }
        if down.is_empty() {
            return Err(Error::Migration(format!("{}: down SQL not found", name)));
        }

        Ok(Self {
            name: name.to_string(),
            version,
            up: up.to_string(),
            down: down.to_string(),
        })
    }
}

fn is_down_marker(line: &str) -> bool {
    line.get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("-- down"))
}

/// Numeric prefix of `<digits>-<rest>.sql`, if the name has that shape
fn version_of(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".sql")?;
    let (digits, rest) = stem.split_once('-')?;
    if digits.is_empty() || rest.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn sort(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
}

/// Load every migration file in `dir`, ordered by version
pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if version_of(&name).is_none() {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())?;
        migrations.push(Migration::parse(&name, &text)?);
    }
    sort(&mut migrations);
    Ok(migrations)
}

/// The migrations shipped with this crate: the reservation tables and the
/// `reshard_ShardReservations` function
pub fn embedded() -> Result<Vec<Migration>> {
    let mut migrations = EMBEDDED
        .iter()
        .map(|(name, text)| Migration::parse(name, text))
        .collect::<Result<Vec<_>>>()?;
    sort(&mut migrations);
    Ok(migrations)
}

/// Where migrations are applied. `apply` and `revert` must update the
/// ledger atomically with the migration itself.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    async fn ensure_ledger(&self) -> Result<()>;
    async fn applied(&self) -> Result<Vec<String>>;
    async fn apply(&self, migration: &Migration) -> Result<()>;
    async fn revert(&self, migration: &Migration) -> Result<()>;
}

pub struct Migrator {
    target: Arc<dyn MigrationTarget>,
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new(target: Arc<dyn MigrationTarget>, mut migrations: Vec<Migration>) -> Self {
        sort(&mut migrations);
        Self { target, migrations }
    }

    /// `(name, applied)` for every known migration
    pub async fn status(&self) -> Result<Vec<(String, bool)>> {
        self.target.ensure_ledger().await?;
        let applied = self.target.applied().await?;
        Ok(self
            .migrations
            .iter()
            .map(|m| (m.name.clone(), applied.contains(&m.name)))
            .collect())
    }

    pub async fn pending(&self) -> Result<Vec<&Migration>> {
        self.target.ensure_ledger().await?;
        let applied = self.target.applied().await?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .collect())
    }

    /// Apply every pending migration in order; returns the applied names
    pub async fn up(&self) -> Result<Vec<String>> {
        let mut done = Vec::new();
        for migration in self.pending().await? {
            tracing::info!("Applying migration {}", migration.name);
            self.target.apply(migration).await?;
            done.push(migration.name.clone());
        }
        Ok(done)
    }

    /// Revert the `steps` most recent applied migrations; returns their names
    pub async fn down(&self, steps: usize) -> Result<Vec<String>> {
        self.target.ensure_ledger().await?;
        let applied = self.target.applied().await?;
        let mut done = Vec::new();
        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| applied.contains(&m.name))
            .take(steps)
        {
            tracing::info!("Reverting migration {}", migration.name);
            self.target.revert(migration).await?;
            done.push(migration.name.clone());
        }
        Ok(done)
    }
}
