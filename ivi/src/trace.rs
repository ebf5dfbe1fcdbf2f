/// Scaling of raw waveform codes into physical values, and repeated capability selectors.
use crate::Error;

/// Selects one instance of a repeated capability, e.g. a channel, by name or position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selector<'a> {
    Name(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for Selector<'a> {
    fn from(x: &'a str) -> Self {
        Selector::Name(x)
    }
}

impl<'a> From<usize> for Selector<'a> {
    fn from(x: usize) -> Self {
        Selector::Index(x)
    }
}

/// Resolve `selector` against the list of repeated capability names.
pub fn get_index<'a, S, T>(names: &[S], selector: T) -> crate::Result<usize>
where
    S: AsRef<str>,
    T: Into<Selector<'a>>,
{
    match selector.into() {
        Selector::Name(name) => names
            .iter()
            .position(|x| x.as_ref() == name)
            .ok_or_else(|| Error::SelectorName(name.to_string())),
        Selector::Index(index) if index < names.len() => Ok(index),
        Selector::Index(index) => Err(Error::SelectorRange {
            index,
            count: names.len(),
        }),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceY {
    pub average_count: u32,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
    /// Raw code marking a missing sample.
    pub y_hole: Option<i32>,
    pub y_raw: Vec<i32>,
}

impl TraceY {
    pub fn new(y_raw: Vec<i32>) -> Self {
        Self {
            average_count: 1,
            y_raw,
            ..Default::default()
        }
    }

    fn scale(&self, raw: i32) -> f64 {
        if self.y_hole == Some(raw) {
            return f64::NAN;
        }
        (raw as f64 - self.y_reference) * self.y_increment + self.y_origin
    }

    pub fn len(&self) -> usize {
        self.y_raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_raw.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.y_raw.get(index).map(|x| self.scale(*x))
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.y_raw.iter().map(move |x| self.scale(*x))
    }

    pub fn y(&self) -> Vec<f64> {
        self.iter().collect()
    }
}

/// A trace with equidistant sample positions, typically time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceYT {
    pub trace: TraceY,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
}

impl TraceYT {
    pub fn new(y_raw: Vec<i32>) -> Self {
        Self {
            trace: TraceY::new(y_raw),
            ..Default::default()
        }
    }

    fn position(&self, index: usize) -> f64 {
        (index as f64 - self.x_reference) * self.x_increment + self.x_origin
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    /// The `(x, y)` pair at `index`.
    pub fn get(&self, index: usize) -> Option<(f64, f64)> {
        self.trace.get(index).map(|y| (self.position(index), y))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.trace
            .iter()
            .enumerate()
            .map(move |(i, y)| (self.position(i), y))
    }

    pub fn x(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.position(i)).collect()
    }

    pub fn t(&self) -> Vec<f64> {
        self.x()
    }

    pub fn y(&self) -> Vec<f64> {
        self.trace.y()
    }
}
