// Mesh & layout planning
//
// A device mesh is an ordered list of named axes with device counts:
//
//   x:2,y:4            → 8 devices arranged as a 2 × 4 grid
//
// A layout maps tensor dimension NAMES onto mesh axes:
//
//   batch:x,heads:y    → every tensor carrying `batch` is split two ways
//                        along x, every tensor carrying `heads` four ways
//                        along y; all other dimensions are replicated
//
// Because layouts speak in dimension names, model code never mentions
// devices. The planner answers the questions the layer library and the
// training controller ask:
//
//   axis_for(dim)          is this dimension split, and along which axis?
//   validate(shape)        does every mapped dimension divide its axis?
//   slice_shape(shape)     per-device shard shape
//   shards(shape)          per-device slice ranges, in row-major mesh order
//   reduction_axes(...)    which axes a contraction must all-reduce over
//
// Every execution of the lowered graph holds all shards in one process. The
// CommLedger records the all-reduces the layout implies, each of which is a
// synchronization barrier on real hardware.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::shape::{Dim, Shape};

/// One named axis of a device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::config("mesh axis names must be non-empty"));
        }
        if size == 0 {
            return Err(Error::config(format!("mesh axis '{name}' must have size > 0")));
        }
        Ok(MeshAxis { name, size })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Ordered named axes of a device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MeshShape {
    axes: Vec<MeshAxis>,
}

impl MeshShape {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self> {
        let mut seen = HashSet::new();
        for a in &axes {
            if !seen.insert(a.name.as_str()) {
                return Err(Error::config(format!(
                    "mesh axis '{}' appears more than once",
                    a.name
                )));
            }
        }
        Ok(MeshShape { axes })
    }

    /// Parse `"x:2,y:4"`. An empty string is a single-device mesh.
    pub fn parse(text: &str) -> Result<Self> {
        let mut axes = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, size) = part
                .split_once(':')
                .ok_or_else(|| Error::config(format!("invalid mesh axis '{part}', expected name:count")))?;
            let size = size
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::config(format!("invalid device count in mesh axis '{part}'")))?;
            axes.push(MeshAxis::new(name.trim(), size)?);
        }
        MeshShape::new(axes)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn axis(&self, name: &str) -> Option<&MeshAxis> {
        self.axes.iter().find(|a| a.name == name)
    }

    /// Total number of devices.
    pub fn size(&self) -> usize {
        self.axes.iter().map(|a| a.size).product()
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}:{}", a.name, a.size))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for MeshShape {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        MeshShape::parse(s)
    }
}

/// Dimension name → mesh axis assignments. Absent names are replicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LayoutRules {
    rules: Vec<(String, String)>,
}

impl LayoutRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `"batch:x,heads:y"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut layout = LayoutRules::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (dim, axis) = part
                .split_once(':')
                .ok_or_else(|| Error::config(format!("invalid layout rule '{part}', expected dim:axis")))?;
            layout.insert(dim.trim(), axis.trim())?;
        }
        Ok(layout)
    }

    /// Map `dim` onto `axis`. A dimension maps to at most one axis.
    pub fn insert(&mut self, dim: &str, axis: &str) -> Result<()> {
        if self.axis_for(dim).is_some() {
            return Err(Error::config(format!(
                "dimension '{dim}' is mapped to more than one mesh axis"
            )));
        }
        self.rules.push((dim.to_string(), axis.to_string()));
        Ok(())
    }

    pub fn axis_for(&self, dim: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(d, _)| d == dim)
            .map(|(_, a)| a.as_str())
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Display for LayoutRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.rules.iter().map(|(d, a)| format!("{d}:{a}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for LayoutRules {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        LayoutRules::parse(s)
    }
}

/// Half-open index range of one shard along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSlice {
    pub start: usize,
    pub end: usize,
}

impl ShardSlice {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The part of a tensor held by one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub device: usize,
    pub mesh_coordinate: Vec<usize>,
    /// One slice per dimension of the global shape, in shape order.
    pub slices: Vec<ShardSlice>,
    pub shape: Shape,
}

/// A mesh together with a layout, validated against each other.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeshPlan {
    mesh: MeshShape,
    layout: LayoutRules,
}

impl MeshPlan {
    /// Combine a mesh and a layout. Every rule must name an existing axis.
    pub fn new(mesh: MeshShape, layout: LayoutRules) -> Result<Self> {
        for (dim, axis) in layout.rules() {
            if mesh.axis(axis).is_none() {
                return Err(Error::config(format!(
                    "layout maps '{dim}' to unknown mesh axis '{axis}' (mesh is '{mesh}')"
                )));
            }
        }
        Ok(MeshPlan { mesh, layout })
    }

    /// Single device, everything replicated.
    pub fn single_device() -> Self {
        MeshPlan::default()
    }

    pub fn mesh(&self) -> &MeshShape {
        &self.mesh
    }

    pub fn layout(&self) -> &LayoutRules {
        &self.layout
    }

    pub fn num_devices(&self) -> usize {
        self.mesh.size()
    }

    /// The axis `dim` is split along, if any.
    pub fn axis_for(&self, dim: &str) -> Option<&MeshAxis> {
        self.layout.axis_for(dim).and_then(|a| self.mesh.axis(a))
    }

    pub fn is_sharded(&self, dim: &str) -> bool {
        self.axis_for(dim).map_or(false, |a| a.size > 1)
    }

    /// Number of pieces `dim` is split into (1 when replicated).
    pub fn split_count(&self, dim: &str) -> usize {
        self.axis_for(dim).map_or(1, |a| a.size)
    }

    /// Per-device size of `dim`.
    pub fn size_per_split(&self, dim: &Dim) -> Result<usize> {
        let n = self.split_count(dim.name());
        if dim.size() % n != 0 {
            return Err(self.indivisible(dim));
        }
        Ok(dim.size() / n)
    }

    fn indivisible(&self, dim: &Dim) -> Error {
        let (axis, devices) = self
            .axis_for(dim.name())
            .map(|a| (a.name.clone(), a.size))
            .unwrap_or_default();
        Error::IndivisibleLayout {
            dim: dim.name().to_string(),
            size: dim.size(),
            axis,
            devices,
        }
    }

    /// Check that `shape` can be laid out: mapped dimensions divide their
    /// axis and no two dimensions of the shape share an axis.
    pub fn validate(&self, shape: &Shape) -> Result<()> {
        let mut used: Vec<(&str, &str)> = Vec::new();
        for d in shape.dims() {
            let Some(axis) = self.axis_for(d.name()) else {
                continue;
            };
            if d.size() % axis.size != 0 {
                return Err(self.indivisible(d));
            }
            if let Some((other, _)) = used.iter().find(|(_, a)| *a == axis.name()) {
                return Err(Error::shape(format!(
                    "dimensions '{other}' and '{}' of {shape} are both split along mesh axis '{}'",
                    d.name(),
                    axis.name()
                )));
            }
            used.push((d.name(), axis.name()));
        }
        Ok(())
    }

    /// Shape of the shard each device holds.
    pub fn slice_shape(&self, shape: &Shape) -> Result<Shape> {
        self.validate(shape)?;
        let dims = shape
            .dims()
            .iter()
            .map(|d| Ok(d.resized(self.size_per_split(d)?)))
            .collect::<Result<Vec<_>>>()?;
        Shape::new(dims)
    }

    /// Per-device shard descriptors, devices in row-major mesh order.
    pub fn shards(&self, shape: &Shape) -> Result<Vec<ShardDescriptor>> {
        let local = self.slice_shape(shape)?;
        let axes = self.mesh.axes();
        let mut out = Vec::with_capacity(self.num_devices());
        for device in 0..self.num_devices() {
            let mut coord = vec![0usize; axes.len()];
            let mut rem = device;
            for (k, a) in axes.iter().enumerate().rev() {
                coord[k] = rem % a.size;
                rem /= a.size;
            }
            let slices = shape
                .dims()
                .iter()
                .zip(local.dims())
                .map(|(d, l)| match self.layout.axis_for(d.name()) {
                    Some(axis) => {
                        let k = axes.iter().position(|a| a.name == axis).unwrap_or(0);
                        let start = coord[k] * l.size();
                        ShardSlice {
                            start,
                            end: start + l.size(),
                        }
                    }
                    None => ShardSlice {
                        start: 0,
                        end: d.size(),
                    },
                })
                .collect();
            out.push(ShardDescriptor {
                device,
                mesh_coordinate: coord,
                slices,
                shape: local.clone(),
            });
        }
        Ok(out)
    }

    /// Mesh axes a contraction over `reduced` must all-reduce across.
    ///
    /// A reduced dimension that is split leaves every device with a partial
    /// sum; the partial sums are combined along that dimension's axis.
    pub fn reduction_axes(&self, reduced: &[Dim]) -> Vec<String> {
        let mut axes: Vec<String> = Vec::new();
        for d in reduced {
            if let Some(a) = self.axis_for(d.name()) {
                if a.size > 1 && !axes.iter().any(|x| x == &a.name) {
                    axes.push(a.name.clone());
                }
            }
        }
        axes
    }

    /// Dimensions of `inputs` that a contraction producing `output` sums over.
    pub fn reduced_dims(inputs: &[&Shape], output: &Shape) -> Vec<Dim> {
        let mut reduced: Vec<Dim> = Vec::new();
        for s in inputs {
            for d in s.dims() {
                if !output.contains(d.name()) && !reduced.iter().any(|r| r.name() == d.name()) {
                    reduced.push(d.clone());
                }
            }
        }
        reduced
    }
}

/// Running count of the collectives a layout implies.
#[derive(Debug, Default)]
pub struct CommLedger {
    allreduces: AtomicU64,
    elements: AtomicU64,
}

/// Snapshot of a [`CommLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommStats {
    pub allreduces: u64,
    /// Per-device elements moved by all-reduces.
    pub elements: u64,
}

impl CommLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a contraction; returns the axes it all-reduces over.
    pub fn record_contraction(
        &self,
        plan: &MeshPlan,
        inputs: &[&Shape],
        output: &Shape,
    ) -> Vec<String> {
        let reduced = MeshPlan::reduced_dims(inputs, output);
        self.record_reduction(plan, &reduced, output)
    }

    /// Record a sum over `reduced` that produces `output`. It needs an
    /// all-reduce when any reduced dim is split over the mesh; returns the
    /// axes involved.
    pub fn record_reduction(&self, plan: &MeshPlan, reduced: &[Dim], output: &Shape) -> Vec<String> {
        let axes = plan.reduction_axes(reduced);
        if !axes.is_empty() {
            let per_device = plan
                .slice_shape(output)
                .map(|s| s.elem_count())
                .unwrap_or_else(|_| output.elem_count());
            self.allreduces.fetch_add(1, Ordering::Relaxed);
            self.elements.fetch_add(per_device as u64, Ordering::Relaxed);
            log::trace!("all-reduce over {axes:?} for {output}");
        }
        axes
    }

    pub fn stats(&self) -> CommStats {
        CommStats {
            allreduces: self.allreduces.load(Ordering::Relaxed),
            elements: self.elements.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.allreduces.store(0, Ordering::Relaxed);
        self.elements.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(mesh: &str, layout: &str) -> MeshPlan {
        MeshPlan::new(MeshShape::parse(mesh).unwrap(), LayoutRules::parse(layout).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_roundtrip_text() {
        let m = MeshShape::parse("x:2, y:4").unwrap();
        assert_eq!(m.size(), 8);
        assert_eq!(m.to_string(), "x:2,y:4");
        assert!(MeshShape::parse("x:2,x:4").unwrap_err().is_config_error());
        assert!(MeshShape::parse("x").is_err());
        assert!(MeshShape::parse("x:0").is_err());
        let l = LayoutRules::parse("batch:x,heads:y").unwrap();
        assert_eq!(l.axis_for("heads"), Some("y"));
        assert_eq!(l.axis_for("embd"), None);
        assert!(LayoutRules::parse("batch:x,batch:y").is_err());
    }

    #[test]
    fn test_unknown_axis_rejected() {
        let err = MeshPlan::new(
            MeshShape::parse("x:2").unwrap(),
            LayoutRules::parse("batch:z").unwrap(),
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_validate_divisibility() {
        let p = plan("x:4", "batch:x");
        let ok = Shape::from_pairs(&[("batch", 8), ("embd", 3)]).unwrap();
        p.validate(&ok).unwrap();
        let bad = Shape::from_pairs(&[("batch", 6), ("embd", 3)]).unwrap();
        let err = p.validate(&bad).unwrap_err();
        assert!(matches!(err, Error::IndivisibleLayout { ref axis, .. } if axis == "x"));
        assert!(err.is_shape_error());
    }

    #[test]
    fn test_same_axis_twice_rejected() {
        let p = plan("x:2", "batch:x,embd:x");
        let s = Shape::from_pairs(&[("batch", 2), ("embd", 2)]).unwrap();
        assert!(p.validate(&s).unwrap_err().is_shape_error());
        // Separately, each is fine.
        p.validate(&Shape::from_pairs(&[("embd", 4)]).unwrap()).unwrap();
    }

    #[test]
    fn test_shards_cover_tensor() {
        let p = plan("x:2,y:2", "batch:x,heads:y");
        let s = Shape::from_pairs(&[("batch", 4), ("heads", 6), ("embd", 3)]).unwrap();
        let local = p.slice_shape(&s).unwrap();
        assert_eq!(local.sizes(), vec![2, 3, 3]);
        let shards = p.shards(&s).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[3].mesh_coordinate, vec![1, 1]);
        assert_eq!(shards[3].slices[0], ShardSlice { start: 2, end: 4 });
        assert_eq!(shards[3].slices[1], ShardSlice { start: 3, end: 6 });
        assert_eq!(shards[1].slices[2], ShardSlice { start: 0, end: 3 });
    }

    #[test]
    fn test_contraction_over_split_dim_is_recorded() {
        let p = plan("x:2", "embd:x");
        let ledger = CommLedger::new();
        let x = Shape::from_pairs(&[("batch", 2), ("embd", 4)]).unwrap();
        let w = Shape::from_pairs(&[("embd", 4), ("vocab", 6)]).unwrap();
        let out = Shape::from_pairs(&[("batch", 2), ("vocab", 6)]).unwrap();
        assert_eq!(ledger.record_contraction(&p, &[&x, &w], &out), vec!["x".to_string()]);
        let stats = ledger.stats();
        assert_eq!(stats.allreduces, 1);
        assert_eq!(stats.elements, 12);

        let replicated = MeshPlan::single_device();
        assert!(ledger.record_contraction(&replicated, &[&x, &w], &out).is_empty());
        assert_eq!(ledger.stats().allreduces, 1);
    }

    #[test]
    fn test_reduction_over_split_batch_is_recorded() {
        let p = plan("x:2", "batch:x");
        let ledger = CommLedger::new();
        let w = Shape::from_pairs(&[("embd", 4), ("vocab", 6)]).unwrap();
        let data = [Dim::new("batch", 4), Dim::new("sequence", 8)];
        assert_eq!(ledger.record_reduction(&p, &data, &w), vec!["x".to_string()]);
        assert_eq!(ledger.stats(), CommStats { allreduces: 1, elements: 24 });
        assert!(ledger.record_reduction(&p, &data[1..], &w).is_empty());
        ledger.reset();
        assert_eq!(ledger.stats(), CommStats::default());
    }
}
