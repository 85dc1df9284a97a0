//! SyncMgr - one reconciliation pass from desired state to the live table.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use iptsync_common::shell::{
    self, IP6TABLES_CMD, IP6TABLES_SAVE_CMD, IPTABLES_CMD, IPTABLES_SAVE_CMD,
};
use iptsync_common::CommandRunner;
use iptsync_rules::{
    drifted_attributes, ensure_unique_names, plan_change, purge_candidates, resolve_position,
    resolve_position_in, AccountLookup, Change, ChainKey, CompareContext, DesiredRuleSpec, Dump,
    Ensure, Family, RuleDecoder, RuleEncoder, RuleRecord, Schema,
};

use crate::accounts::SystemAccounts;
use crate::config::{is_builtin_chain, DesiredState};
use crate::error::{SyncError, SyncResult};

/// Filter CLI for a family.
pub fn filter_tool(family: Family) -> &'static str {
    match family {
        Family::V4 => IPTABLES_CMD,
        Family::V6 => IP6TABLES_CMD,
    }
}

/// Dump tool for a family.
pub fn save_tool(family: Family) -> &'static str {
    match family {
        Family::V4 => IPTABLES_SAVE_CMD,
        Family::V6 => IP6TABLES_SAVE_CMD,
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub purged: usize,
    pub noop: usize,
    pub chains_created: usize,
    pub policies_set: usize,
    /// Every mutating command, in issue order.
    pub commands: Vec<String>,
}

impl CycleReport {
    /// True when the live table already matched.
    pub fn is_converged(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} purged={} noop={} chains_created={} policies_set={}",
            self.created,
            self.updated,
            self.deleted,
            self.purged,
            self.noop,
            self.chains_created,
            self.policies_set
        )
    }
}

/// Rule names per chain, kept in chain order as commands are issued.
type WorkingNames = HashMap<ChainKey, Vec<String>>;

/// Reconciles the live packet filter with a [`DesiredState`].
///
/// Commands are issued one at a time through the runner; the first failure
/// aborts the cycle and leaves earlier changes in place.
pub struct SyncMgr<R: CommandRunner> {
    runner: R,
    schema: &'static Schema,
    accounts: Box<dyn AccountLookup>,
    families: Vec<Family>,
    dump_files: HashMap<Family, PathBuf>,
    dry_run: bool,
}

impl<R: CommandRunner> SyncMgr<R> {
    /// Creates a manager for both families using the system account database.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            schema: Schema::standard(),
            accounts: Box::new(SystemAccounts),
            families: Family::all().to_vec(),
            dump_files: HashMap::new(),
            dry_run: false,
        }
    }

    /// Restricts the cycle to the given families.
    pub fn with_families(mut self, families: impl IntoIterator<Item = Family>) -> Self {
        self.families = families.into_iter().collect();
        self
    }

    /// Reads the dump for `family` from a file instead of the save tool.
    pub fn with_dump_file(mut self, family: Family, path: impl Into<PathBuf>) -> Self {
        self.dump_files.insert(family, path.into());
        self
    }

    /// Logs the command plan without executing it.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_accounts(mut self, accounts: impl AccountLookup + 'static) -> Self {
        self.accounts = Box::new(accounts);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    /// Runs one full reconciliation pass.
    #[instrument(skip_all, fields(rules = desired.rules.len(), dry_run = self.dry_run))]
    pub async fn run_cycle(&mut self, desired: &DesiredState) -> SyncResult<CycleReport> {
        let dump = self.read_dumps().await?;
        let families = self.families.clone();
        let mut report = CycleReport::default();

        let mut working = WorkingNames::new();
        for record in &dump.rules {
            working
                .entry(record.key())
                .or_default()
                .push(record.name.clone());
        }

        self.sync_chains(desired, &dump, &mut report).await?;

        let present = desired.present_names();
        let mut deleted: HashSet<String> = HashSet::new();

        for spec in desired
            .rules
            .iter()
            .filter(|r| r.ensure == Ensure::Absent && families.contains(&r.family))
        {
            match dump.find(&spec.name) {
                Some(record) => {
                    info!(rule = %spec.name, "Deleting rule marked absent");
                    self.delete(record, &mut working, &mut report).await?;
                    report.deleted += 1;
                    deleted.insert(record.name.clone());
                }
                None => report.noop += 1,
            }
        }

        for chain in desired
            .chains
            .iter()
            .filter(|c| c.purge && families.contains(&c.family))
        {
            let key = chain.key();
            let candidates = purge_candidates(
                &key,
                &dump.rules,
                &chain.ignore_patterns,
                chain.ignore_foreign,
            );
            for record in candidates {
                if present.contains(record.name.as_str()) || deleted.contains(&record.name) {
                    continue;
                }
                info!(rule = %record.name, chain = %key, "Purging unrequested rule");
                self.delete(record, &mut working, &mut report).await?;
                report.purged += 1;
                deleted.insert(record.name.clone());
            }
        }

        let mut wanted: Vec<&DesiredRuleSpec> = desired
            .rules
            .iter()
            .filter(|r| r.ensure == Ensure::Present)
            .filter(|r| {
                let enabled = families.contains(&r.family);
                if !enabled {
                    debug!(rule = %r.name, family = %r.family, "Skipping rule for disabled family");
                }
                enabled
            })
            .collect();
        wanted.sort_by(|a, b| a.name.cmp(&b.name));

        for spec in wanted {
            self.apply_rule(spec, &dump, &mut working, &mut report)
                .await?;
        }

        info!("Cycle complete: {}", report);
        Ok(report)
    }

    async fn read_dumps(&mut self) -> SyncResult<Dump> {
        let decoder = RuleDecoder::new(self.schema);
        let mut dump = Dump::default();

        for family in self.families.clone() {
            let text = match self.dump_files.get(&family) {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| SyncError::Io {
                        path: path.display().to_string(),
                        source,
                    })?,
                None => {
                    self.runner
                        .run(&shell::save_command(save_tool(family), None))
                        .await?
                }
            };
            let decoded = decoder.decode(&text, family)?;
            debug!(
                family = %family,
                chains = decoded.chains.len(),
                rules = decoded.rules.len(),
                "Decoded live rules"
            );
            dump.extend(decoded);
        }

        // Names must be unique across both families.
        ensure_unique_names(&dump.rules)?;
        Ok(dump)
    }

    async fn sync_chains(
        &mut self,
        desired: &DesiredState,
        dump: &Dump,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let families = self.families.clone();
        let mut known: HashSet<ChainKey> = dump.chains.iter().map(|c| c.key()).collect();

        for chain in desired.chains.iter().filter(|c| families.contains(&c.family)) {
            let key = chain.key();
            if !chain.is_builtin() && !known.contains(&key) {
                self.create_chain(&key, report).await?;
                known.insert(key.clone());
            }

            let Some(policy) = &chain.policy else {
                continue;
            };
            if !chain.is_builtin() {
                warn!(chain = %key, policy = %policy, "Ignoring policy on user-defined chain");
                continue;
            }
            let current = dump.chain(&key).and_then(|c| c.policy.as_deref());
            if current != Some(policy.as_str()) {
                let cmd = format!(
                    "{} -t {} -P {} {}",
                    filter_tool(key.family),
                    key.table,
                    key.chain,
                    policy
                );
                info!(chain = %key, from = ?current, to = %policy, "Setting chain policy");
                self.execute(cmd, report).await?;
                report.policies_set += 1;
            }
        }

        let referenced: Vec<ChainKey> = desired
            .rules
            .iter()
            .filter(|r| r.ensure == Ensure::Present && families.contains(&r.family))
            .map(|r| r.key())
            .collect();
        for key in referenced {
            if !is_builtin_chain(&key.chain) && !known.contains(&key) {
                self.create_chain(&key, report).await?;
                known.insert(key);
            }
        }
        Ok(())
    }

    async fn create_chain(&mut self, key: &ChainKey, report: &mut CycleReport) -> SyncResult<()> {
        info!(chain = %key, "Creating chain");
        let cmd = format!(
            "{} -t {} -N {}",
            filter_tool(key.family),
            key.table,
            key.chain
        );
        self.execute(cmd, report).await?;
        report.chains_created += 1;
        Ok(())
    }

    #[instrument(skip_all, fields(rule = %spec.name, chain = %spec.chain, table = %spec.table))]
    async fn apply_rule(
        &mut self,
        spec: &DesiredRuleSpec,
        dump: &Dump,
        working: &mut WorkingNames,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let observed = dump.find(&spec.name);
        let (change, drifted) = {
            let ctx = CompareContext::new(spec.family, self.accounts.as_ref());
            let change = plan_change(observed, Some(spec), self.schema, &ctx);
            let drifted = match (change, observed) {
                (Change::Update, Some(record)) => {
                    drifted_attributes(record, spec, self.schema, &ctx)
                }
                _ => Vec::new(),
            };
            (change, drifted)
        };

        match (change, observed) {
            (Change::Noop, _) => {
                debug!("Rule in sync");
                report.noop += 1;
            }
            (Change::Create, _) => {
                self.insert(spec, working, report).await?;
                report.created += 1;
            }
            (Change::Update, Some(record)) => {
                info!(drifted = ?drifted, "Rule drifted");
                let key = spec.key();
                let current = working.get(&key).cloned().unwrap_or_default();
                let slot = current.iter().position(|n| *n == spec.name).map(|i| i + 1);
                if record.key() == key && slot == Some(resolve_position(&current, &spec.name)) {
                    let position = slot.unwrap_or(1);
                    let args = RuleEncoder::new(self.schema).render(spec, position)?;
                    let cmd = format!("{} -t {} -R {}", filter_tool(spec.family), spec.table, args);
                    self.execute(cmd, report).await?;
                } else {
                    self.delete(record, working, report).await?;
                    self.insert(spec, working, report).await?;
                }
                report.updated += 1;
            }
            (Change::Update, None) | (Change::Delete, _) => {
                // Absent rules were handled before any insert.
                debug!(change = %change, "Nothing to apply");
            }
        }
        Ok(())
    }

    async fn insert(
        &mut self,
        spec: &DesiredRuleSpec,
        working: &mut WorkingNames,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let key = spec.key();
        let names = working.entry(key.clone()).or_default();
        let position = resolve_position_in(&key, names, &spec.name);
        let args = RuleEncoder::new(self.schema).render(spec, position)?;
        let cmd = format!("{} -t {} -I {}", filter_tool(spec.family), spec.table, args);

        self.execute(cmd, report).await?;
        let names = working.entry(key).or_default();
        let idx = (position - 1).min(names.len());
        names.insert(idx, spec.name.clone());
        Ok(())
    }

    async fn delete(
        &mut self,
        record: &RuleRecord,
        working: &mut WorkingNames,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let cmd = format!(
            "{} -t {} {}",
            filter_tool(record.family),
            record.table,
            record.delete_args()
        );
        self.execute(cmd, report).await?;
        if let Some(names) = working.get_mut(&record.key()) {
            names.retain(|n| *n != record.name);
        }
        Ok(())
    }

    async fn execute(&mut self, cmd: String, report: &mut CycleReport) -> SyncResult<()> {
        if self.dry_run {
            info!("[dry-run] {}", cmd);
        } else {
            self.runner.run(&cmd).await?;
            debug!(command = %cmd, "Applied");
        }
        report.commands.push(cmd);
        Ok(())
    }
}
