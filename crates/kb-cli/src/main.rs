mod derive;
mod simulate;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kb_core::time::display_timestamp;
use kb_core::{
    Annotation, CycleReport, DomainAxiom, EpistemicLevel, FactId, FactStatus, GrainSummary,
    Manifest,
};
use kb_store::{Cartridge, Library, QueryRequest, default_base_dir};
use serde::Deserialize;

use crate::derive::{parse_derivation, split_list};
use crate::simulate::SimulateOptions;

#[derive(Parser)]
#[command(name = "kb", about = "Kitbash cartridges: facts in, ternary grains out")]
struct Cli {
    /// Library directory (default: $KB_DATA_DIR or ~/.kitbash)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty cartridge
    New { name: String },

    /// List cartridges
    List,

    /// Add one fact
    Add {
        cartridge: String,
        content: String,
        #[arg(long, default_value_t = 0.5)]
        confidence: f64,
        /// pos:T, neg:T[=reason], ind:T, boundary:T=cond, range:T=min..max
        #[arg(long = "derive")]
        derivations: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
        /// empirical, narrative, axiomatic, persona (or l0..l3)
        #[arg(long)]
        level: Option<EpistemicLevel>,
        #[arg(long)]
        domain: Option<String>,
        /// Record this fact as a correction of an existing one
        #[arg(long)]
        supersedes: Option<FactId>,
    },

    /// Import facts from a JSON-lines file of {"content", "annotation"}
    Import { cartridge: String, path: PathBuf },

    /// Register or replace a domain axiom
    Axiom {
        cartridge: String,
        name: String,
        /// Comma-separated concepts
        concepts: String,
    },

    /// Run a tracked query
    Query {
        cartridge: String,
        #[arg(required = true)]
        keywords: Vec<String>,
        /// Comma-separated concepts for this access
        #[arg(long, default_value = "")]
        concepts: String,
        #[arg(long)]
        confidence: Option<f64>,
        /// Also track the result set as one pattern
        #[arg(long)]
        pattern: bool,
    },

    /// Close a cycle now
    Cycle {
        cartridge: Option<String>,
        /// Every cartridge, in parallel
        #[arg(long, conflicts_with = "cartridge")]
        all: bool,
    },

    /// Drive a cartridge with a synthetic query stream
    Simulate {
        cartridge: String,
        #[arg(required = true)]
        keywords: Vec<String>,
        #[arg(long, default_value = "")]
        concepts: String,
        #[arg(long, default_value_t = 60)]
        queries: usize,
        #[arg(long, default_value_t = 0.88)]
        min_confidence: f64,
        #[arg(long, default_value_t = 0.93)]
        max_confidence: f64,
        #[arg(long)]
        pattern: bool,
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List a cartridge's grains
    Grains {
        cartridge: Option<String>,
        /// Every cartridge, with per-cartridge counts
        #[arg(long, conflicts_with = "cartridge")]
        all: bool,
    },

    /// Print one grain as JSON, with its shape and packed size
    Inspect { cartridge: String, grain_id: String },

    /// Dry-run all three validation checks on phantoms awaiting a grain
    Validate { cartridge: String },

    /// Set a cartridge's description and add domains or tags
    Describe {
        cartridge: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Comma-separated domains to add
        #[arg(long, default_value = "")]
        domains: String,
        /// Comma-separated tags to add
        #[arg(long, default_value = "")]
        tags: String,
    },

    /// Ask a grain about a signal: +1, -1, or 0
    Ternary {
        cartridge: String,
        grain_id: String,
        signal: String,
    },

    /// Show cartridge statistics
    Stats { cartridge: String },

    /// Change a fact's lifecycle status
    Status {
        cartridge: String,
        fact_id: FactId,
        /// active, archived, deprecated, tombstone
        status: FactStatus,
    },

    /// Move a cartridge to the archive
    Archive { name: String },

    /// Flush a degraded cartridge and make it writable again
    Recover { cartridge: String },
}

#[derive(Deserialize)]
struct ImportLine {
    content: String,
    #[serde(default)]
    annotation: Annotation,
}

fn open_library(cli: &Cli) -> Result<Library> {
    let base = cli.data_dir.clone().unwrap_or_else(default_base_dir);
    Library::open(&base).with_context(|| format!("failed to open library at {}", base.display()))
}

fn open_cartridge(library: &Library, name: &str) -> Result<std::sync::Arc<Cartridge>> {
    library
        .cartridge(name)
        .with_context(|| format!("failed to open cartridge '{name}'"))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let library = open_library(&cli)?;
    match &cli.command {
        Commands::New { name } => cmd_new(&library, name),
        Commands::List => cmd_list(&library),
        Commands::Add {
            cartridge,
            content,
            confidence,
            derivations,
            sources,
            level,
            domain,
            supersedes,
        } => {
            let mut annotation = Annotation::new(*confidence);
            for d in derivations {
                annotation = annotation.with_derivation(parse_derivation(d)?);
            }
            for s in sources {
                annotation = annotation.with_source(s);
            }
            if let Some(level) = level {
                annotation = annotation.with_level(*level);
            }
            if let Some(domain) = domain {
                annotation = annotation.with_domain(domain);
            }
            cmd_add(&library, cartridge, content, annotation, *supersedes)
        }
        Commands::Import { cartridge, path } => cmd_import(&library, cartridge, path),
        Commands::Axiom {
            cartridge,
            name,
            concepts,
        } => cmd_axiom(&library, cartridge, name, &split_list(concepts)),
        Commands::Query {
            cartridge,
            keywords,
            concepts,
            confidence,
            pattern,
        } => {
            let mut request = QueryRequest::new(keywords.as_slice())
                .with_concepts(split_list(concepts).as_slice());
            request.confidence = *confidence;
            request.pattern = *pattern;
            cmd_query(&library, cartridge, &request)
        }
        Commands::Cycle { cartridge, all } => cmd_cycle(&library, cartridge.as_deref(), *all),
        Commands::Simulate {
            cartridge,
            keywords,
            concepts,
            queries,
            min_confidence,
            max_confidence,
            pattern,
            seed,
        } => {
            let opts = SimulateOptions {
                keywords: keywords.clone(),
                concepts: split_list(concepts),
                queries: *queries,
                min_confidence: *min_confidence,
                max_confidence: *max_confidence,
                pattern: *pattern,
                seed: *seed,
            };
            cmd_simulate(&library, cartridge, &opts)
        }
        Commands::Grains { cartridge, all } => match (cartridge.as_deref(), *all) {
            (_, true) => cmd_grains_all(&library),
            (Some(name), false) => cmd_grains(&library, name),
            (None, false) => bail!("name a cartridge or pass --all"),
        },
        Commands::Validate { cartridge } => cmd_validate(&library, cartridge),
        Commands::Describe {
            cartridge,
            description,
            domains,
            tags,
        } => cmd_describe(
            &library,
            cartridge,
            description,
            &split_list(domains),
            &split_list(tags),
        ),
        Commands::Inspect {
            cartridge,
            grain_id,
        } => cmd_inspect(&library, cartridge, grain_id),
        Commands::Ternary {
            cartridge,
            grain_id,
            signal,
        } => cmd_ternary(&library, cartridge, grain_id, signal),
        Commands::Stats { cartridge } => cmd_stats(&library, cartridge),
        Commands::Status {
            cartridge,
            fact_id,
            status,
        } => cmd_status(&library, cartridge, *fact_id, *status),
        Commands::Archive { name } => cmd_archive(&library, name),
        Commands::Recover { cartridge } => cmd_recover(&library, cartridge),
    }
}

fn cmd_new(library: &Library, name: &str) -> Result<()> {
    let cartridge = library
        .create(name)
        .with_context(|| format!("failed to create cartridge '{name}'"))?;
    println!("created {} at {}", cartridge.name(), cartridge.dir().display());
    Ok(())
}

fn cmd_list(library: &Library) -> Result<()> {
    let names = library.list().context("failed to list cartridges")?;
    if names.is_empty() {
        println!("(no cartridges)");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn cmd_add(
    library: &Library,
    cartridge: &str,
    content: &str,
    annotation: Annotation,
    supersedes: Option<FactId>,
) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let added = match supersedes {
        Some(old) => c
            .supersede_fact(old, content, annotation)
            .with_context(|| format!("failed to supersede fact {old}"))?,
        None => c.add_fact(content, annotation).context("failed to add fact")?,
    };
    if added.is_new {
        println!("added fact {}", added.id);
    } else {
        println!("exists as fact {}", added.id);
    }
    if let Some(old) = supersedes {
        println!("deprecated fact {old}");
    }
    Ok(())
}

fn cmd_import(library: &Library, cartridge: &str, path: &Path) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let (mut added, mut existing) = (0usize, 0usize);
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ImportLine = serde_json::from_str(line)
            .with_context(|| format!("{} line {}: invalid record", path.display(), n + 1))?;
        let result = c
            .add_fact(&record.content, record.annotation)
            .with_context(|| format!("{} line {}", path.display(), n + 1))?;
        if result.is_new {
            added += 1;
        } else {
            existing += 1;
        }
    }
    println!("imported {} → {added} new, {existing} existing", path.display());
    Ok(())
}

fn cmd_axiom(library: &Library, cartridge: &str, name: &str, concepts: &[String]) -> Result<()> {
    if concepts.is_empty() {
        bail!("axiom '{name}' needs at least one concept");
    }
    let c = open_cartridge(library, cartridge)?;
    let is_new = c
        .add_axiom(DomainAxiom::new(name, concepts))
        .context("failed to save axiom")?;
    println!(
        "{} axiom {name}: {}",
        if is_new { "added" } else { "replaced" },
        concepts.join(", ")
    );
    Ok(())
}

fn cmd_query(library: &Library, cartridge: &str, request: &QueryRequest) -> Result<()> {
    let outcome = library
        .query_and_track(cartridge, request)
        .context("query failed")?;
    let c = open_cartridge(library, cartridge)?;
    // hits are only flushed at cycle end; one query per process needs this
    c.checkpoint().context("failed to checkpoint")?;

    if outcome.fact_ids.is_empty() {
        println!("(no facts found)");
    }
    for (id, status) in &outcome.statuses {
        let (fact, _) = c.get_fact(*id)?;
        println!("[{id}] ({status}) {}", fact.content);
    }
    if let Some(report) = &outcome.cycle {
        print_cycle(cartridge, report);
    }
    Ok(())
}

fn cmd_cycle(library: &Library, cartridge: Option<&str>, all: bool) -> Result<()> {
    if all {
        let results = library.advance_all().context("failed to advance cartridges")?;
        if results.is_empty() {
            println!("(no cartridges)");
        }
        let mut failed = 0;
        for (name, result) in results {
            match result {
                Ok(report) => print_cycle(&name, &report),
                Err(e) => {
                    failed += 1;
                    eprintln!("{name}: cycle failed: {e}");
                }
            }
        }
        if failed > 0 {
            bail!("{failed} cartridge(s) failed to advance");
        }
        return Ok(());
    }
    let Some(name) = cartridge else {
        bail!("name a cartridge or pass --all");
    };
    let report = library
        .advance(name)
        .with_context(|| format!("failed to advance '{name}'"))?;
    print_cycle(name, &report);
    Ok(())
}

fn print_cycle(name: &str, report: &CycleReport) {
    println!(
        "{name}: closed cycle {} ({} locked, {} grains, {} failed validation)",
        report.cycle,
        report.newly_locked.len(),
        report.grains.len(),
        report.failures.len()
    );
    for grain in &report.grains {
        println!(
            "  grain {} ← {} via {} (weight {:.3})",
            grain.grain_id, grain.phantom_origin, grain.axiom_link, grain.weight
        );
    }
    for (key, failure) in &report.failures {
        println!("  {key}: {failure}");
    }
}

fn cmd_simulate(library: &Library, cartridge: &str, opts: &SimulateOptions) -> Result<()> {
    let summary = simulate::run(library, cartridge, opts)?;
    println!(
        "simulated {} queries: {} hits, {} cycles, {} validation failures",
        summary.queries, summary.hits, summary.cycles, summary.failures
    );
    for grain in &summary.grains {
        println!(
            "  grain {} ← {} via {} (weight {:.3})",
            grain.grain_id, grain.phantom_origin, grain.axiom_link, grain.weight
        );
    }
    Ok(())
}

fn cmd_grains(library: &Library, cartridge: &str) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let grains = c.grain_summaries().context("failed to read grain registry")?;
    if grains.is_empty() {
        println!("(no grains)");
    }
    for g in &grains {
        print_grain_row("", g);
    }
    Ok(())
}

fn cmd_grains_all(library: &Library) -> Result<()> {
    let all = library
        .grain_summaries()
        .context("failed to read grain registries")?;
    if all.is_empty() {
        println!("(no cartridges)");
    }
    let mut total = 0;
    for (name, grains) in &all {
        println!("{name}: {} grains", grains.len());
        for g in grains {
            print_grain_row("  ", g);
        }
        total += grains.len();
    }
    println!("total: {total} grains in {} cartridges", all.len());
    Ok(())
}

fn print_grain_row(indent: &str, g: &GrainSummary) {
    let supersedes = g
        .supersedes
        .as_ref()
        .map(|s| format!(" supersedes {s}"))
        .unwrap_or_default();
    println!(
        "{indent}{}  {}  axiom={}  weight={:.3}  cycle={}  {}{supersedes}",
        g.grain_id, g.phantom_origin, g.axiom_link, g.weight, g.created_cycle, g.lock_state
    );
}

fn cmd_inspect(library: &Library, cartridge: &str, grain_id: &str) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let grain = c
        .load_grain(grain_id)
        .with_context(|| format!("failed to load grain {grain_id}"))?;
    let (refs, packed) = grain.pack();
    let view = serde_json::json!({
        "grain": grain,
        "metrics": grain.metrics(),
        "compression": grain.compression_stats(),
        "packed": { "refs": refs, "planes": packed },
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&view).context("failed to serialize grain")?
    );
    Ok(())
}

fn cmd_validate(library: &Library, cartridge: &str) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let report = c.validate_pending();
    if report.total == 0 {
        println!("(no phantoms awaiting a grain)");
        return Ok(());
    }
    println!(
        "{} phantoms: persistence {}, resistance {}, independence {}, all {} (rejection rate {:.1}%)",
        report.total,
        report.passed_persistence,
        report.passed_resistance,
        report.passed_independence,
        report.passed_all,
        report.rejection_rate() * 100.0
    );
    for key in &report.ready {
        println!("  ready    {key}");
    }
    for (key, failures) in &report.rejected {
        for failure in failures {
            println!("  rejected {key}: {failure}");
        }
    }
    Ok(())
}

fn cmd_describe(
    library: &Library,
    cartridge: &str,
    description: &str,
    domains: &[String],
    tags: &[String],
) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let manifest = c
        .describe(description, domains, tags)
        .context("failed to update manifest")?;
    print_manifest(&manifest);
    Ok(())
}

fn print_manifest(m: &Manifest) {
    let join = |set: &std::collections::BTreeSet<String>| {
        set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    };
    println!("description:  {}", m.description);
    println!("domains:      {}", join(&m.domains));
    println!("tags:         {}", join(&m.tags));
    println!("updated:      {}", display_timestamp(m.updated_at));
}

fn cmd_ternary(library: &Library, cartridge: &str, grain_id: &str, signal: &str) -> Result<()> {
    library
        .activate(cartridge)
        .with_context(|| format!("failed to activate '{cartridge}'"))?;
    let answer = library
        .ternary_query(grain_id, signal)
        .with_context(|| format!("ternary query on {grain_id} failed"))?;
    println!("{answer}");
    Ok(())
}

fn cmd_stats(library: &Library, cartridge: &str) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let s = c.stats();
    let grains = c.grain_count().context("failed to read grain registry")?;
    let manifest = c.manifest().context("failed to read manifest")?;

    println!("cartridge:    {}", c.name());
    println!("health:       {}", c.health());
    println!("facts:        {} ({} active)", s.facts, s.active_facts);
    println!("tokens:       {}", s.index_tokens);
    println!("axioms:       {}", s.axioms);
    println!(
        "phantoms:     {} (incubating {}, persistent {}, locked {})",
        s.phantoms, s.incubating, s.persistent, s.locked
    );
    println!("crystallized: {}", s.crystallized);
    println!("grains:       {grains}");
    println!("cycle:        {}", s.cycle);
    print_manifest(&manifest);
    Ok(())
}

fn cmd_status(library: &Library, cartridge: &str, id: FactId, status: FactStatus) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    let previous = c
        .set_status(id, status)
        .with_context(|| format!("failed to set fact {id} to {status}"))?;
    println!("fact {id}: {previous} → {status}");
    Ok(())
}

fn cmd_archive(library: &Library, name: &str) -> Result<()> {
    let dest = library
        .archive(name)
        .with_context(|| format!("failed to archive '{name}'"))?;
    println!("archived {name} to {}", dest.display());
    Ok(())
}

fn cmd_recover(library: &Library, cartridge: &str) -> Result<()> {
    let c = open_cartridge(library, cartridge)?;
    c.recover().context("recovery failed")?;
    println!("{}: {}", c.name(), c.health());
    Ok(())
}
