//! Addresses of step outputs nested inside loop iterations.
//!
//! A path is a value: entering or leaving an iteration produces a new path and
//! never mutates the receiver, so a path captured in a pause record stays valid
//! while the interpreter keeps walking.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopFrame {
    pub loop_name: String,
    pub iteration: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepExecutionPath {
    frames: Vec<LoopFrame>,
}

impl StepExecutionPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            frames: frames
                .into_iter()
                .map(|(loop_name, iteration)| LoopFrame {
                    loop_name: loop_name.into(),
                    iteration,
                })
                .collect(),
        }
    }

    pub fn loop_iteration(&self, loop_name: &str, iteration: usize) -> Self {
        push(
            self,
            LoopFrame {
                loop_name: loop_name.to_string(),
                iteration,
            },
        )
    }

    pub fn remove_last(&self) -> Self {
        pop(self)
    }

    pub fn frames(&self) -> &[LoopFrame] {
        &self.frames
    }

    pub fn is_root(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

pub fn push(path: &StepExecutionPath, frame: LoopFrame) -> StepExecutionPath {
    let mut frames = Vec::with_capacity(path.frames.len() + 1);
    frames.extend(path.frames.iter().cloned());
    frames.push(frame);
    StepExecutionPath { frames }
}

/// Popping the root path yields the root path.
pub fn pop(path: &StepExecutionPath) -> StepExecutionPath {
    let keep = path.frames.len().saturating_sub(1);
    StepExecutionPath {
        frames: path.frames[..keep].to_vec(),
    }
}

impl fmt::Display for StepExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return write!(f, "root");
        }
        for (idx, frame) in self.frames.iter().enumerate() {
            if idx > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}[{}]", frame.loop_name, frame.iteration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_path() -> impl Strategy<Value = StepExecutionPath> {
        prop::collection::vec(("[a-z]{1,8}", 0usize..1000), 0..6)
            .prop_map(StepExecutionPath::from_frames)
    }

    proptest! {
        #[test]
        fn pop_after_push_restores_path(
            path in arb_path(),
            name in "[a-z]{1,8}",
            iteration in 0usize..1000,
        ) {
            let pushed = path.loop_iteration(&name, iteration);
            prop_assert_eq!(pushed.depth(), path.depth() + 1);
            prop_assert_eq!(pushed.remove_last(), path);
        }

        #[test]
        fn nested_pushes_unwind_to_the_start(
            path in arb_path(),
            frames in prop::collection::vec(("[a-z]{1,8}", 0usize..1000), 0..8),
        ) {
            let mut nested = path.clone();
            for (name, iteration) in &frames {
                nested = nested.loop_iteration(name, *iteration);
            }
            for _ in 0..frames.len() {
                nested = nested.remove_last();
            }
            prop_assert_eq!(nested, path);
        }
    }

    #[test]
    fn push_leaves_receiver_untouched() {
        let root = StepExecutionPath::root();
        let inner = root.loop_iteration("Loop", 2);
        assert!(root.is_root());
        assert_eq!(inner.frames().len(), 1);
        assert_eq!(inner.frames()[0].loop_name, "Loop");
        assert_eq!(inner.frames()[0].iteration, 2);
    }

    #[test]
    fn pop_of_root_is_root() {
        assert_eq!(StepExecutionPath::root().remove_last(), StepExecutionPath::root());
    }

    #[test]
    fn display_lists_frames() {
        let path = StepExecutionPath::from_frames([("Outer", 1), ("Inner", 0)]);
        assert_eq!(path.to_string(), "Outer[1]/Inner[0]");
        assert_eq!(StepExecutionPath::root().to_string(), "root");
    }
}
