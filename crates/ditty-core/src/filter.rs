//! Stereo filters.
//!
//! A filter is a frame transform with access to its live options. Filters are
//! declared from a [`FilterDef`] and instantiated once per task when the chain
//! that uses them is built. Children of a node run after it, in the order they
//! were connected.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::options::{OptionSet, Options};
use crate::synth::Frame;

/// Frame transform.
pub trait FilterProcess: Send {
    fn process(&mut self, frame: Frame, options: &Options) -> Result<Frame>;
}

impl<F> FilterProcess for F
where
    F: FnMut(Frame, &Options) -> Result<Frame> + Send,
{
    fn process(&mut self, frame: Frame, options: &Options) -> Result<Frame> {
        self(frame, options)
    }
}

/// Creates one processor per filter instance.
pub type FilterFactory = Arc<dyn Fn(&Options) -> Result<Box<dyn FilterProcess>> + Send + Sync>;

/// A named filter definition.
#[derive(Clone)]
pub struct FilterDef {
    name: String,
    factory: FilterFactory,
    defaults: OptionSet,
}

impl fmt::Debug for FilterDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDef")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl FilterDef {
    pub fn new(name: &str, factory: FilterFactory, defaults: OptionSet) -> Self {
        Self {
            name: name.to_string(),
            factory,
            defaults: defaults.over(&OptionSet::new().with("name", name)),
        }
    }

    /// Definition backed by a stateless function.
    pub fn from_fn<F>(name: &str, process: F, defaults: OptionSet) -> Self
    where
        F: Fn(Frame, &Options) -> Result<Frame> + Clone + Send + Sync + 'static,
    {
        let factory: FilterFactory =
            Arc::new(move |_options: &Options| -> Result<Box<dyn FilterProcess>> {
                Ok(Box::new(process.clone()))
            });
        Self::new(name, factory, defaults)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &OptionSet {
        &self.defaults
    }

    /// Create a processor bound to `options`.
    pub fn instantiate(&self, options: &Options) -> Result<Box<dyn FilterProcess>> {
        (self.factory)(options)
    }
}

/// An instantiated filter and the filters connected after it.
pub struct FilterNode {
    name: String,
    options: Options,
    processor: Box<dyn FilterProcess>,
    children: Vec<FilterNode>,
}

impl FilterNode {
    pub fn new(name: &str, options: Options, processor: Box<dyn FilterProcess>) -> Self {
        Self {
            name: name.to_string(),
            options,
            processor,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, child: FilterNode) {
        self.children.push(child);
    }

    pub fn process(&mut self, frame: Frame) -> Result<Frame> {
        let mut frame = self.processor.process(frame, &self.options)?;
        for child in &mut self.children {
            frame = child.process(frame)?;
        }
        Ok(frame)
    }
}

/// Filters attached to a loop or a shared filter, run in connection order.
#[derive(Default)]
pub struct FilterChain {
    nodes: Vec<FilterNode>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: FilterNode) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn process(&mut self, mut frame: Frame) -> Result<Frame> {
        for node in &mut self.nodes {
            frame = node.process(frame)?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;

    fn gain_def() -> FilterDef {
        FilterDef::from_fn(
            "gain",
            |frame: Frame, options: &Options| {
                let gain = options.number_or("gain", 1.0)?;
                Ok([frame[0] * gain, frame[1] * gain])
            },
            OptionSet::new().with("gain", 0.5),
        )
    }

    #[test]
    fn test_chain_runs_in_order() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let def = gain_def();
        let options = Options::new(&ctx, def.defaults().clone());
        let mut first = FilterNode::new("gain", options.clone(), def.instantiate(&options).unwrap());

        let swap = FilterDef::from_fn("swap", |frame: Frame, _: &Options| Ok([frame[1], frame[0]]), OptionSet::new());
        let swap_options = Options::new(&ctx, swap.defaults().clone());
        first.push(FilterNode::new("swap", swap_options.clone(), swap.instantiate(&swap_options).unwrap()));

        let mut chain = FilterChain::new();
        chain.push(first);
        assert_eq!(chain.process([1.0, 0.0]).unwrap(), [0.0, 0.5]);
    }

    #[test]
    fn test_live_options_are_read_each_frame() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let def = gain_def();
        let options = Options::new(&ctx, def.defaults().clone());
        let mut node = FilterNode::new("gain", options.clone(), def.instantiate(&options).unwrap());
        assert_eq!(node.process([1.0, 1.0]).unwrap(), [0.5, 0.5]);
        options.set_now("gain", 2.0.into());
        assert_eq!(node.process([1.0, 1.0]).unwrap(), [2.0, 2.0]);
        assert_eq!(options.text("name").as_deref(), Some("gain"));
    }

    #[test]
    fn test_stateful_filter_keeps_state() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let factory: FilterFactory = Arc::new(|_options: &Options| -> Result<Box<dyn FilterProcess>> {
            let mut last = [0.0, 0.0];
            Ok(Box::new(move |frame: Frame, _: &Options| -> Result<Frame> {
                let out = [(frame[0] + last[0]) * 0.5, (frame[1] + last[1]) * 0.5];
                last = frame;
                Ok(out)
            }))
        });
        let def = FilterDef::new("smooth", factory, OptionSet::new());
        let options = Options::new(&ctx, def.defaults().clone());
        let mut processor = def.instantiate(&options).unwrap();
        assert_eq!(processor.process([1.0, 1.0], &options).unwrap(), [0.5, 0.5]);
        assert_eq!(processor.process([1.0, 1.0], &options).unwrap(), [1.0, 1.0]);
    }
}
