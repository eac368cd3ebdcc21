//! Funnel (cache-oblivious k-merger).
//!
//! A funnel of height *h* merges *k* = 2<sup>*h*</sup> sorted inputs into a single sorted output. It is a
//! complete binary tree of two-way mergers laid out recursively: the tree is split at half its height into a
//! top funnel and 2<sup>*h<sub>top</sub>*</sup> bottom funnels, and the output of every bottom funnel is buffered
//! in a queue holding ⌈*k<sub>top</sub>*<sup>1.5</sup>⌉ items. Buffers are refilled lazily, only when the merger
//! reading from them finds them empty. For more information see
//! [Cache-oblivious algorithms](http://courses.csail.mit.edu/6.851/spring12/lectures/L09.html).

use std::cmp::Ordering;

use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueBuilder, QueueError};

/// Returns the smallest power of two greater than or equal to `x`.
pub fn hyperceil(x: usize) -> usize {
    x.next_power_of_two()
}

/// Returns the capacity of the buffers placed between a top funnel of fan-in `k` and its bottom funnels.
pub fn buffer_capacity(k: usize) -> usize {
    (k as f64).powf(1.5).ceil() as usize
}

/// Queues the funnel reads from.
pub type Leaves<T> = [Box<dyn BufferedQueue<T>>];

type QueuePair<'a, T> = (&'a mut (dyn BufferedQueue<T> + 'static), &'a mut (dyn BufferedQueue<T> + 'static));

enum Side {
    Left,
    Right,
}

enum Inputs<T> {
    /// Bottom level merger reading leaves `2 * index` and `2 * index + 1`.
    Leaves { index: usize },
    Nodes { left: Box<Node<T>>, right: Box<Node<T>> },
}

/// Two-way merger.
struct Merger<T> {
    exhausted: bool,
    inputs: Inputs<T>,
}

/// Non-root merger along with the buffer it merges into.
struct Node<T> {
    out: Box<dyn BufferedQueue<T>>,
    merger: Merger<T>,
}

impl<T> Merger<T> {
    fn leaf() -> Self {
        Merger {
            exhausted: false,
            inputs: Inputs::Leaves { index: 0 },
        }
    }

    /// Builds the merge tree of a funnel of the given height and returns its root.
    fn build<B>(height: u32, builder: &B) -> Result<Self, QueueError>
    where
        B: QueueBuilder<T> + ?Sized,
    {
        if height <= 1 {
            return Ok(Merger::leaf());
        }
        let height_bottom = hyperceil(height.div_ceil(2) as usize) as u32;
        let height_top = height - height_bottom;

        let mut top = Merger::build(height_top, builder)?;
        let k = 1usize << height_top;
        let capacity = buffer_capacity(k);

        let mut bottom = Vec::with_capacity(k);
        for _ in 0..k {
            bottom.push(Some(Node {
                out: builder.build(capacity)?,
                merger: Merger::build(height_bottom, builder)?,
            }));
        }
        top.attach(&mut bottom, 0)?;

        return Ok(top);
    }

    /// Wires bottom funnels `2i` and `2i + 1` under the `i`-th leaf of this tree.
    fn attach(&mut self, bottom: &mut [Option<Node<T>>], i: usize) -> Result<(), QueueError> {
        match &mut self.inputs {
            Inputs::Leaves { .. } => {
                let left = bottom.get_mut(2 * i).and_then(Option::take);
                let right = bottom.get_mut(2 * i + 1).and_then(Option::take);
                match (left, right) {
                    (Some(left), Some(right)) => {
                        self.inputs = Inputs::Nodes {
                            left: Box::new(left),
                            right: Box::new(right),
                        };
                        Ok(())
                    }
                    _ => Err(QueueError::ProtocolViolation("bottom funnel is missing")),
                }
            }
            Inputs::Nodes { left, right } => {
                left.merger.attach(bottom, i << 1)?;
                right.merger.attach(bottom, i << 1 | 1)
            }
        }
    }

    /// Numbers bottom level mergers from left to right.
    fn assign_index(&mut self, i: usize) {
        match &mut self.inputs {
            Inputs::Leaves { index } => *index = i,
            Inputs::Nodes { left, right } => {
                left.merger.assign_index(i << 1);
                right.merger.assign_index(i << 1 | 1);
            }
        }
    }

    /// Merges the inputs into `out` until `out` is full or the inputs are exhausted.
    fn fill<W, F>(&mut self, leaves: &mut Leaves<T>, out: &mut W, compare: &F) -> Result<(), QueueError>
    where
        W: ItemWriter<T> + ?Sized,
        F: Fn(&T, &T) -> Ordering,
    {
        while !out.is_full() {
            let (left, right): QueuePair<'_, T> = match &mut self.inputs {
                Inputs::Leaves { index } => leaf_pair(leaves, *index)?,
                Inputs::Nodes { left, right } => {
                    left.top_up(leaves, compare)?;
                    right.top_up(leaves, compare)?;
                    (left.out.as_mut(), right.out.as_mut())
                }
            };

            let side = match (left.peek()?, right.peek()?) {
                (None, None) => None,
                (Some(_), None) => Some(Side::Left),
                (None, Some(_)) => Some(Side::Right),
                (Some(l), Some(r)) => match compare(l, r) {
                    Ordering::Less => Some(Side::Left),
                    // equal heads are taken from the right input
                    _ => Some(Side::Right),
                },
            };
            let source = match side {
                Some(Side::Left) => left,
                Some(Side::Right) => right,
                None => {
                    left.close()?;
                    right.close()?;
                    self.exhausted = true;
                    return Ok(());
                }
            };

            match source.read()? {
                Some(item) => out.write(item)?,
                None => return Err(QueueError::ProtocolViolation("peeked item disappeared")),
            }
        }

        return Ok(());
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if let Inputs::Nodes { left, right } = &mut self.inputs {
            left.close()?;
            right.close()?;
        }
        Ok(())
    }
}

impl<T> Node<T> {
    /// Refills the node buffer if it was drained and the node still has input.
    fn top_up<F>(&mut self, leaves: &mut Leaves<T>, compare: &F) -> Result<(), QueueError>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        if self.merger.exhausted || !self.out.is_empty() {
            return Ok(());
        }
        self.out.reset()?;
        self.merger.fill(leaves, self.out.as_mut(), compare)
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.merger.close()?;
        self.out.close()
    }
}

fn leaf_pair<T>(leaves: &mut Leaves<T>, index: usize) -> Result<QueuePair<'_, T>, QueueError> {
    match leaves.get_mut(2 * index..2 * index + 2) {
        Some([left, right]) => Ok((left.as_mut(), right.as_mut())),
        _ => Err(QueueError::ProtocolViolation("funnel leaf is missing")),
    }
}

/// Funnel.
/// Merges [`Funnel::k`] sorted queues into a single sorted output.
pub struct Funnel<T> {
    height: u32,
    root: Merger<T>,
}

impl<T> Funnel<T> {
    /// Creates a funnel of the given height.
    ///
    /// # Arguments
    /// * `height` - Funnel height, the funnel merges 2<sup>height</sup> inputs
    /// * `builder` - Builder of the funnel internal buffers
    pub fn new<B>(height: u32, builder: &B) -> Result<Self, QueueError>
    where
        B: QueueBuilder<T> + ?Sized,
    {
        let mut root = Merger::build(height, builder)?;
        root.assign_index(0);

        log::debug!("funnel created (height: {}, k: {})", height, 1usize << height);

        return Ok(Funnel { height, root });
    }

    /// Creates the smallest funnel merging at least `k` inputs.
    pub fn with_fan_in<B>(k: usize, builder: &B) -> Result<Self, QueueError>
    where
        B: QueueBuilder<T> + ?Sized,
    {
        Funnel::new(hyperceil(k).trailing_zeros(), builder)
    }

    /// Returns the number of inputs the funnel merges.
    pub fn k(&self) -> usize {
        1 << self.height
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Checks if the funnel has merged all of its input.
    pub fn is_exhausted(&self) -> bool {
        self.root.exhausted
    }

    /// Merges sorted leaves into the output.
    ///
    /// Leaves are read directly and are closed once the merger reading them drains them. When two heads compare
    /// equal the one coming from the leaf further right is written first, so the merge is not stable.
    ///
    /// # Arguments
    /// * `leaves` - Exactly [`Funnel::k`] queues sorted according to `compare`; pad with
    ///   [`EmptyQueue`](crate::queue::EmptyQueue)s if there are fewer inputs
    /// * `out` - Output the merged items are written to
    /// * `compare` - Function used to compare items
    pub fn fill<W, F>(&mut self, leaves: &mut Leaves<T>, out: &mut W, compare: F) -> Result<(), QueueError>
    where
        W: ItemWriter<T> + ?Sized,
        F: Fn(&T, &T) -> Ordering,
    {
        if leaves.len() != self.k() {
            return Err(QueueError::ProtocolViolation("leaves number does not match the funnel fan-in"));
        }
        if self.root.exhausted {
            return Err(QueueError::ProtocolViolation("funnel is already exhausted"));
        }

        if self.height == 0 {
            let leaf = leaves[0].as_mut();
            while !out.is_full() {
                match leaf.read()? {
                    Some(item) => out.write(item)?,
                    None => {
                        leaf.close()?;
                        self.root.exhausted = true;
                        break;
                    }
                }
            }
            return Ok(());
        }

        return self.root.fill(leaves, out, &compare);
    }

    /// Closes the funnel internal buffers.
    pub fn close(&mut self) -> Result<(), QueueError> {
        self.root.close()
    }
}
