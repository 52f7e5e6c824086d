use std::fmt;

use crate::error::{Error, Result};

// Shape: ordered list of NAMED dimensions
//
// Every dimension carries a name as well as a size:
//
//   [batch=4, sequence=16, embd=8]
//
// Names, not positions, give a dimension its meaning. Two tensors that both
// carry `embd` agree on what that axis is, whatever order they store it in.
// Operations match dimensions by name: a contraction sums over the names that
// are absent from the requested output, a broadcast adds the names that are
// missing from an operand. The same name appearing with two sizes in one
// computation is always an error.
//
// The order of a shape only decides memory layout (row-major, last dimension
// contiguous). A mesh layout refers to dimensions by name too, which is what
// lets a model be sharded without the model code knowing about devices.

/// A named dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dim {
    name: String,
    size: usize,
}

impl Dim {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Dim {
            name: name.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Same size under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Dim {
        Dim::new(name, self.size)
    }

    /// Same name with a different size.
    pub fn resized(&self, size: usize) -> Dim {
        Dim::new(self.name.clone(), size)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.size)
    }
}

/// N-dimensional shape made of uniquely named dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<Dim>);

impl Shape {
    /// Build a shape, rejecting duplicate names and zero-sized dimensions.
    pub fn new(dims: Vec<Dim>) -> Result<Self> {
        for (i, d) in dims.iter().enumerate() {
            if d.size == 0 {
                return Err(Error::shape(format!(
                    "dimension '{}' has size 0",
                    d.name
                )));
            }
            if dims[..i].iter().any(|o| o.name == d.name) {
                return Err(Error::DuplicateDimension {
                    name: d.name.clone(),
                });
            }
        }
        Ok(Shape(dims))
    }

    /// Convenience constructor from `(name, size)` pairs.
    pub fn from_pairs(pairs: &[(&str, usize)]) -> Result<Self> {
        Shape::new(pairs.iter().map(|(n, s)| Dim::new(*n, *s)).collect())
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().map(|d| d.size).product()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.0.iter().map(|d| d.size).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Look up a dimension by name.
    pub fn dim(&self, name: &str) -> Result<&Dim> {
        self.0
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::DimensionNotFound {
                name: name.to_string(),
                shape: self.clone(),
            })
    }

    pub fn size_of(&self, name: &str) -> Result<usize> {
        Ok(self.dim(name)?.size)
    }

    /// Append the dimensions of `other`. Names must be disjoint.
    pub fn concat(&self, other: &Shape) -> Result<Shape> {
        let mut dims = self.0.clone();
        dims.extend(other.0.iter().cloned());
        Shape::new(dims)
    }

    /// Merge two shapes: the dimensions of `self` in order, then the
    /// dimensions only `other` has. Shared names must agree on size.
    pub fn union(&self, other: &Shape) -> Result<Shape> {
        let mut dims = self.0.clone();
        for d in &other.0 {
            match self.0.iter().find(|s| s.name == d.name) {
                Some(s) if s.size != d.size => {
                    return Err(Error::DimensionSizeMismatch {
                        name: d.name.clone(),
                        expected: s.size,
                        got: d.size,
                    })
                }
                Some(_) => {}
                None => dims.push(d.clone()),
            }
        }
        Ok(Shape(dims))
    }

    /// The shape with the named dimension sliced out.
    pub fn without(&self, name: &str) -> Result<Shape> {
        self.dim(name)?;
        Ok(Shape(
            self.0.iter().filter(|d| d.name != name).cloned().collect(),
        ))
    }

    /// The shape with every listed dimension removed. Missing names are ignored.
    pub fn without_all(&self, names: &[&str]) -> Shape {
        Shape(
            self.0
                .iter()
                .filter(|d| !names.contains(&d.name.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Rename one dimension in place.
    pub fn rename(&self, old: &str, new: &str) -> Result<Shape> {
        let idx = self.index_of(old).ok_or_else(|| Error::DimensionNotFound {
            name: old.to_string(),
            shape: self.clone(),
        })?;
        let mut dims = self.0.clone();
        dims[idx] = dims[idx].renamed(new);
        Shape::new(dims)
    }

    /// Change the size of one dimension.
    pub fn resize(&self, name: &str, size: usize) -> Result<Shape> {
        let idx = self.index_of(name).ok_or_else(|| Error::DimensionNotFound {
            name: name.to_string(),
            shape: self.clone(),
        })?;
        let mut dims = self.0.clone();
        dims[idx] = dims[idx].resized(size);
        Shape::new(dims)
    }

    /// Replace one dimension by a list of dimensions, in place.
    pub fn replace(&self, name: &str, with: &[Dim]) -> Result<Shape> {
        let idx = self.index_of(name).ok_or_else(|| Error::DimensionNotFound {
            name: name.to_string(),
            shape: self.clone(),
        })?;
        let mut dims = self.0[..idx].to_vec();
        dims.extend(with.iter().cloned());
        dims.extend(self.0[idx + 1..].iter().cloned());
        Shape::new(dims)
    }

    /// Same set of dimensions, order ignored.
    pub fn same_dims(&self, other: &Shape) -> bool {
        self.rank() == other.rank() && self.0.iter().all(|d| other.0.contains(d))
    }

    /// Check that `self` can be broadcast to `target`: every dimension of
    /// `self` must be present in `target` with the same size.
    pub fn check_broadcast_to(&self, target: &Shape) -> Result<()> {
        for d in &self.0 {
            let t = target.dim(&d.name)?;
            if t.size != d.size {
                return Err(Error::DimensionSizeMismatch {
                    name: d.name.clone(),
                    expected: t.size,
                    got: d.size,
                });
            }
        }
        Ok(())
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1].size;
            }
        }
        strides
    }

    /// Strides for walking the index space of `target` while reading a
    /// buffer laid out as `self`. Dimensions of `target` that `self` lacks
    /// get stride 0 (broadcast). Shared names must agree on size.
    pub fn strides_for(&self, target: &Shape) -> Result<Vec<usize>> {
        let own = self.stride_contiguous();
        target
            .0
            .iter()
            .map(|t| match self.index_of(&t.name) {
                Some(i) if self.0[i].size != t.size => Err(Error::DimensionSizeMismatch {
                    name: t.name.clone(),
                    expected: t.size,
                    got: self.0[i].size,
                }),
                Some(i) => Ok(own[i]),
                None => Ok(0),
            })
            .collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Per-element source offsets of a buffer shaped `src` when walking `target`.
///
/// `src` must broadcast to `target`. The result has `target.elem_count()`
/// entries in row-major order of `target`.
pub fn broadcast_offsets(src: &Shape, target: &Shape) -> Result<Vec<usize>> {
    let strides = src.strides_for(target)?;
    let sizes = target.sizes();
    let n = target.elem_count();
    let mut out = Vec::with_capacity(n);
    let mut counter = vec![0usize; sizes.len()];
    let mut off = 0usize;
    for _ in 0..n {
        out.push(off);
        let mut k = sizes.len();
        while k > 0 {
            k -= 1;
            counter[k] += 1;
            off += strides[k];
            if counter[k] < sizes[k] {
                break;
            }
            off -= strides[k] * sizes[k];
            counter[k] = 0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(pairs: &[(&str, usize)]) -> Shape {
        Shape::from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Shape::from_pairs(&[("batch", 2), ("batch", 2)]).unwrap_err();
        assert!(err.is_shape_error());
        assert!(Shape::from_pairs(&[("batch", 0)]).is_err());
    }

    #[test]
    fn test_union_and_concat() {
        let a = s(&[("batch", 2), ("embd", 4)]);
        let b = s(&[("embd", 4), ("vocab", 10)]);
        assert_eq!(a.union(&b).unwrap(), s(&[("batch", 2), ("embd", 4), ("vocab", 10)]));
        assert!(a.concat(&b).is_err());
        let c = s(&[("embd", 5)]);
        assert!(matches!(
            a.union(&c),
            Err(Error::DimensionSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_rename_replace_without() {
        let a = s(&[("batch", 2), ("sequence", 6), ("embd", 4)]);
        let r = a.rename("sequence", "memory_length").unwrap();
        assert_eq!(r.names(), vec!["batch", "memory_length", "embd"]);
        assert!(a.rename("sequence", "embd").is_err());
        let rep = a
            .replace("sequence", &[Dim::new("blocks", 2), Dim::new("block_len", 3)])
            .unwrap();
        assert_eq!(rep.sizes(), vec![2, 2, 3, 4]);
        assert_eq!(a.without("sequence").unwrap().names(), vec!["batch", "embd"]);
        assert!(a.without("heads").is_err());
    }

    #[test]
    fn test_strides_for_broadcast() {
        let src = s(&[("embd", 3)]);
        let target = s(&[("batch", 2), ("embd", 3)]);
        assert_eq!(src.strides_for(&target).unwrap(), vec![0, 1]);
        let offs = broadcast_offsets(&src, &target).unwrap();
        assert_eq!(offs, vec![0, 1, 2, 0, 1, 2]);

        let t = s(&[("embd", 3), ("batch", 2)]);
        let offs = broadcast_offsets(&target, &t).unwrap();
        assert_eq!(offs, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_scalar() {
        assert_eq!(Shape::scalar().elem_count(), 1);
        assert_eq!(format!("{}", s(&[("a", 2), ("b", 3)])), "[a=2, b=3]");
    }
}
