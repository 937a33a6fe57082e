//! Score declarations.
//!
//! Evaluating a score fills a [`ScoreDefinition`]: synth and filter
//! definitions, declared loops, filter instances and how they are connected.
//! The dry run only reads the resulting [`ScoreStructure`]; a generator task
//! evaluates the same score again and builds the one node it renders.
//!
//! Connections follow one rule per node: its output either continues through
//! local filters or ends in a single shared filter, never both.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::ContextHandle;
use crate::error::{DittyError, Result};
use crate::filter::{FilterChain, FilterDef, FilterNode};
use crate::options::{OptionSet, Options};
use crate::scheduler::{LiveLoop, LoopBody};
use crate::synth::SynthDef;
use crate::topology::{NodeKind, NodeOut, RunAs, ScoreStructure, TopologyEntry};

/// Creates the body of a loop from the loop's options.
pub type LoopBodyFactory = Arc<dyn Fn(&Options) -> Result<Box<dyn LoopBody>> + Send + Sync>;

/// Where a node sends its output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    /// Local filters, in connection order.
    pub filters: Vec<String>,
    /// Shared filter terminating the node.
    pub shared: Option<String>,
}

#[derive(Clone)]
pub struct LoopDecl {
    pub name: String,
    pub options: Options,
    body: LoopBodyFactory,
    pub routing: Routing,
}

#[derive(Clone)]
pub struct FilterDecl {
    pub name: String,
    def: Arc<FilterDef>,
    pub options: Options,
    pub run_as: RunAs,
    pub routing: Routing,
}

#[derive(Default)]
struct Declarations {
    synths: BTreeMap<String, Arc<SynthDef>>,
    synth_ids: usize,
    filter_defs: BTreeMap<String, Arc<FilterDef>>,
    filter_ids: usize,
    loops: Vec<LoopDecl>,
    filters: Vec<FilterDecl>,
}

impl Declarations {
    fn routing_mut(&mut self, name: &str) -> Option<&mut Routing> {
        if let Some(decl) = self.loops.iter_mut().find(|l| l.name == name) {
            return Some(&mut decl.routing);
        }
        self.filters
            .iter_mut()
            .find(|f| f.name == name)
            .map(|f| &mut f.routing)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.filters.iter().any(|f| f.name == name) || self.loops.iter().any(|l| l.name == name)
    }
}

/// Declarations of one evaluated score. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScoreDefinition {
    inner: Arc<Mutex<Declarations>>,
    ctx: ContextHandle,
}

impl fmt::Debug for ScoreDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decls = self.lock();
        f.debug_struct("ScoreDefinition")
            .field("synths", &decls.synths.keys().collect::<Vec<_>>())
            .field("loops", &decls.loops.iter().map(|l| &l.name).collect::<Vec<_>>())
            .field("filters", &decls.filters.iter().map(|f| &f.name).collect::<Vec<_>>())
            .finish()
    }
}

impl ScoreDefinition {
    /// An empty score with the built-in synths registered.
    pub fn new(ctx: &ContextHandle) -> Self {
        let score = Self {
            inner: Arc::new(Mutex::new(Declarations::default())),
            ctx: ctx.clone(),
        };
        score.define_synth(SynthDef::sine());
        score
    }

    fn lock(&self) -> MutexGuard<'_, Declarations> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &ContextHandle {
        &self.ctx
    }

    // === Synths ===

    /// Name for an unnamed synth definition.
    pub fn next_synth_name(&self) -> String {
        let mut decls = self.lock();
        let name = format!("synth_{}", decls.synth_ids);
        decls.synth_ids += 1;
        name
    }

    pub fn define_synth(&self, def: SynthDef) -> Arc<SynthDef> {
        let def = Arc::new(def);
        self.lock().synths.insert(def.name().to_string(), def.clone());
        def
    }

    pub fn synth(&self, name: &str) -> Option<Arc<SynthDef>> {
        self.lock().synths.get(name).cloned()
    }

    // === Filters ===

    /// Name for an unnamed filter definition.
    pub fn next_filter_name(&self) -> String {
        let mut decls = self.lock();
        let name = format!("filter_{}", decls.filter_ids);
        decls.filter_ids += 1;
        name
    }

    pub fn define_filter(&self, def: FilterDef) -> Arc<FilterDef> {
        let def = Arc::new(def);
        self.lock().filter_defs.insert(def.name().to_string(), def.clone());
        def
    }

    pub fn filter_def(&self, name: &str) -> Option<Arc<FilterDef>> {
        self.lock().filter_defs.get(name).cloned()
    }

    /// Declare a filter instance. Returns its unique name.
    pub fn create_filter(&self, def: &Arc<FilterDef>, options: OptionSet, run_as: RunAs) -> String {
        let merged = options.over(def.defaults());
        let base = merged.text("name").unwrap_or(def.name()).to_string();

        let mut decls = self.lock();
        let mut name = base.clone();
        let mut suffix = 1;
        while decls.name_taken(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        let options = Options::new(&self.ctx, merged.with("name", name.as_str()));
        decls.filters.push(FilterDecl {
            name: name.clone(),
            def: def.clone(),
            options,
            run_as,
            routing: Routing::default(),
        });
        log::debug!("[SCORE] declared {} filter {}", if run_as == RunAs::Task { "shared" } else { "inline" }, name);
        name
    }

    pub fn filter_options(&self, name: &str) -> Option<Options> {
        self.lock()
            .filters
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.options.clone())
    }

    pub fn filter_run_as(&self, name: &str) -> Option<RunAs> {
        self.lock().filters.iter().find(|f| f.name == name).map(|f| f.run_as)
    }

    // === Loops ===

    /// Options every loop starts from.
    pub fn loop_defaults(index: usize) -> OptionSet {
        OptionSet::new()
            .with("amp", 1.0)
            .with("pan", 0.0)
            .with("sync", -1.0)
            .with("cutoff", 0.5)
            .with("name", format!("loop_{}", index))
    }

    /// Declare a loop. A loop with the name of an existing one replaces it.
    pub fn add_loop(&self, body: LoopBodyFactory, options: OptionSet) -> String {
        let mut decls = self.lock();
        let merged = options.over(&Self::loop_defaults(decls.loops.len()));
        let name = merged.text("name").unwrap_or("loop").to_string();
        let decl = LoopDecl {
            name: name.clone(),
            options: Options::new(&self.ctx, merged),
            body,
            routing: Routing::default(),
        };
        match decls.loops.iter_mut().find(|l| l.name == name) {
            Some(existing) => *existing = decl,
            None => decls.loops.push(decl),
        }
        log::debug!("[SCORE] declared loop {}", name);
        name
    }

    pub fn loop_options(&self, name: &str) -> Option<Options> {
        self.lock()
            .loops
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.options.clone())
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.lock().loops.iter().map(|l| l.name.clone()).collect()
    }

    pub fn has_loops(&self) -> bool {
        !self.lock().loops.is_empty()
    }

    // === Connections ===

    /// Send the output of loop or filter `from` through filter `to`.
    pub fn connect(&self, from: &str, to: &str) -> Result<()> {
        let mut decls = self.lock();
        let run_as = decls
            .filters
            .iter()
            .find(|f| f.name == to)
            .map(|f| f.run_as)
            .ok_or_else(|| DittyError::UnknownNode(to.to_string()))?;
        if from == to {
            return Err(DittyError::Config(format!("{} can't connect to itself.", from)));
        }
        let routing = decls
            .routing_mut(from)
            .ok_or_else(|| DittyError::UnknownNode(from.to_string()))?;

        if routing.shared.is_some() {
            return Err(DittyError::Config(format!(
                "{} can't connect - already connected to shared filter.",
                from
            )));
        }
        match run_as {
            RunAs::Task if !routing.filters.is_empty() => Err(DittyError::Config(format!(
                "{} can't connect to shared filter {} - already connected to local filters.",
                from, to
            ))),
            RunAs::Task => {
                routing.shared = Some(to.to_string());
                Ok(())
            }
            RunAs::Inline => {
                routing.filters.push(to.to_string());
                Ok(())
            }
        }
    }

    // === Structure ===

    pub fn structure(&self) -> ScoreStructure {
        let decls = self.lock();
        let out = |routing: &Routing, default: NodeOut| match &routing.shared {
            Some(name) => NodeOut::shared(name),
            None => default,
        };
        ScoreStructure {
            bpm: self.ctx.bpm(),
            sample_rate: self.ctx.sample_rate(),
            loops: decls
                .loops
                .iter()
                .map(|l| TopologyEntry {
                    name: l.name.clone(),
                    kind: NodeKind::Loop,
                    run_as: RunAs::Task,
                    out: out(&l.routing, NodeOut::output()),
                })
                .collect(),
            filters: decls
                .filters
                .iter()
                .map(|f| match f.run_as {
                    RunAs::Task => TopologyEntry {
                        name: f.name.clone(),
                        kind: NodeKind::SharedFilter,
                        run_as: RunAs::Task,
                        out: out(&f.routing, NodeOut::output()),
                    },
                    RunAs::Inline => TopologyEntry {
                        name: f.name.clone(),
                        kind: NodeKind::InlineFilter,
                        run_as: RunAs::Inline,
                        out: out(&f.routing, NodeOut::inline()),
                    },
                })
                .collect(),
        }
    }

    // === Instantiation ===

    /// Build a declared loop with its filter chain.
    pub fn build_loop(&self, name: &str) -> Result<LiveLoop> {
        let decl = self
            .lock()
            .loops
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| DittyError::UnknownNode(name.to_string()))?;

        let body = (decl.body)(&decl.options)?;
        let mut stack = vec![decl.name.clone()];
        let filters = self.build_chain(&decl.routing.filters, &mut stack)?;
        Ok(LiveLoop::new(&self.ctx, &decl.name, decl.options, body, filters))
    }

    /// Build a shared filter and the local filters connected after it.
    pub fn build_shared_filter(&self, name: &str) -> Result<FilterNode> {
        match self.filter_run_as(name) {
            Some(RunAs::Task) => self.build_node(name, &mut Vec::new()),
            Some(RunAs::Inline) => Err(DittyError::Config(format!("{} is not a shared filter", name))),
            None => Err(DittyError::UnknownNode(name.to_string())),
        }
    }

    fn build_chain(&self, names: &[String], stack: &mut Vec<String>) -> Result<FilterChain> {
        let mut chain = FilterChain::new();
        for name in names {
            chain.push(self.build_node(name, stack)?);
        }
        Ok(chain)
    }

    fn build_node(&self, name: &str, stack: &mut Vec<String>) -> Result<FilterNode> {
        if stack.iter().any(|n| n == name) {
            return Err(DittyError::Config(format!(
                "filter cycle: {} -> {}",
                stack.join(" -> "),
                name
            )));
        }
        let decl = self
            .lock()
            .filters
            .iter()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| DittyError::UnknownNode(name.to_string()))?;

        let processor = decl.def.instantiate(&decl.options)?;
        let mut node = FilterNode::new(&decl.name, decl.options.clone(), processor);
        stack.push(decl.name.clone());
        for child in &decl.routing.filters {
            node.push(self.build_node(child, stack)?);
        }
        stack.pop();
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::Frame;

    fn score() -> ScoreDefinition {
        ScoreDefinition::new(&ContextHandle::new(120.0, 44100).unwrap())
    }

    fn silent_body() -> LoopBodyFactory {
        Arc::new(|_options: &Options| -> Result<Box<dyn LoopBody>> {
            Ok(Box::new(|_cycle: u64, _options: &Options| -> Result<()> { Ok(()) }))
        })
    }

    fn halve() -> FilterDef {
        FilterDef::from_fn(
            "halve",
            |frame: Frame, _: &Options| Ok([frame[0] * 0.5, frame[1] * 0.5]),
            OptionSet::new(),
        )
    }

    #[test]
    fn test_sine_is_registered() {
        let score = score();
        assert_eq!(score.synth("sine").unwrap().name(), "sine");
        assert!(score.synth("saw").is_none());
    }

    #[test]
    fn test_loop_defaults_and_names() {
        let score = score();
        let first = score.add_loop(silent_body(), OptionSet::new());
        let second = score.add_loop(silent_body(), OptionSet::new().with("name", "bass").with("sync", 4.0));
        assert_eq!(first, "loop_0");
        assert_eq!(second, "bass");
        let options = score.loop_options("loop_0").unwrap();
        assert_eq!(options.number("cutoff").unwrap(), Some(0.5));
        assert_eq!(options.number("sync").unwrap(), Some(-1.0));
        assert_eq!(score.loop_options("bass").unwrap().number("sync").unwrap(), Some(4.0));
    }

    #[test]
    fn test_filter_instances_get_unique_names() {
        let score = score();
        let def = score.define_filter(halve());
        assert_eq!(score.create_filter(&def, OptionSet::new(), RunAs::Inline), "halve");
        assert_eq!(score.create_filter(&def, OptionSet::new(), RunAs::Inline), "halve_1");
        let named = score.create_filter(&def, OptionSet::new().with("name", "echo"), RunAs::Task);
        assert_eq!(named, "echo");
        assert_eq!(
            score.filter_options("halve_1").unwrap().text("name").as_deref(),
            Some("halve_1")
        );
    }

    #[test]
    fn test_connect_after_shared_is_rejected() {
        let score = score();
        let def = score.define_filter(halve());
        let lp = score.add_loop(silent_body(), OptionSet::new().with("name", "lead"));
        let shared = score.create_filter(&def, OptionSet::new().with("name", "reverb"), RunAs::Task);
        let local = score.create_filter(&def, OptionSet::new(), RunAs::Inline);

        score.connect(&lp, &shared).unwrap();
        let err = score.connect(&lp, &local).unwrap_err();
        assert_eq!(err.to_string(), "lead can't connect - already connected to shared filter.");
        let err = score.connect(&lp, &shared).unwrap_err();
        assert!(matches!(err, DittyError::Config(_)));

        // the failed calls left the routing untouched
        let structure = score.structure();
        assert_eq!(structure.loops[0].out, NodeOut::shared("reverb"));
    }

    #[test]
    fn test_shared_after_local_is_rejected() {
        let score = score();
        let def = score.define_filter(halve());
        let lp = score.add_loop(silent_body(), OptionSet::new());
        let local = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        let shared = score.create_filter(&def, OptionSet::new().with("name", "reverb"), RunAs::Task);
        score.connect(&lp, &local).unwrap();
        assert!(matches!(score.connect(&lp, &shared), Err(DittyError::Config(_))));
        assert!(matches!(score.connect(&lp, "missing"), Err(DittyError::UnknownNode(_))));
    }

    #[test]
    fn test_structure() {
        let score = score();
        let def = score.define_filter(halve());
        let lp = score.add_loop(silent_body(), OptionSet::new());
        let shared = score.create_filter(&def, OptionSet::new().with("name", "reverb"), RunAs::Task);
        let local = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        score.connect(&lp, &shared).unwrap();
        score.connect(&shared, &local).unwrap();

        let structure = score.structure();
        assert_eq!(structure.bpm, 120.0);
        assert_eq!(structure.sample_rate, 44100);
        assert_eq!(structure.loops.len(), 1);
        assert_eq!(structure.filters.len(), 2);
        assert_eq!(structure.filters[0].kind, NodeKind::SharedFilter);
        assert_eq!(structure.filters[0].out, NodeOut::output());
        assert_eq!(structure.filters[1].run_as, RunAs::Inline);
        assert!(structure.validate().is_ok());
    }

    #[test]
    fn test_build_loop_with_chain() {
        let score = score();
        let def = score.define_filter(halve());
        let lp = score.add_loop(silent_body(), OptionSet::new().with("sync", 1.0));
        let a = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        let b = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        score.connect(&lp, &a).unwrap();
        score.connect(&a, &b).unwrap();
        let mut live = score.build_loop(&lp).unwrap();
        assert_eq!(live.name(), "loop_0");
        assert_eq!(live.process().unwrap(), [0.0, 0.0]);
    }

    #[test]
    fn test_inline_cycle_is_detected() {
        let score = score();
        let def = score.define_filter(halve());
        let lp = score.add_loop(silent_body(), OptionSet::new());
        let a = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        let b = score.create_filter(&def, OptionSet::new(), RunAs::Inline);
        score.connect(&lp, &a).unwrap();
        score.connect(&a, &b).unwrap();
        score.connect(&b, &a).unwrap();
        assert!(matches!(score.build_loop(&lp), Err(DittyError::Config(_))));
    }

    #[test]
    fn test_build_shared_filter() {
        let score = score();
        let def = score.define_filter(halve());
        let shared = score.create_filter(&def, OptionSet::new(), RunAs::Task);
        let mut node = score.build_shared_filter(&shared).unwrap();
        assert_eq!(node.process([1.0, 1.0]).unwrap(), [0.5, 0.5]);
        assert!(score.build_shared_filter("nope").is_err());
    }
}
