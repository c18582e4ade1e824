//! The aggregator contract and the wire-name registry.
//!
//! An aggregator is anything that can absorb values, merge a peer of its
//! own type, and round-trip through an archive. The server instantiates
//! aggregators from wire type names, so every concrete type in use must be
//! registered on both sides.

use std::any::Any;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Mutex;

use lattice_proto::{Archive, ArchiveError, ArchiveValue};

/// Object-safe aggregator capability set.
pub trait Aggregator: Send + 'static {
	/// Resets to the identity value.
	fn init(&mut self);
	/// Merges another aggregator of the same concrete type. A mismatched
	/// type is ignored with a log record.
	fn merge(&mut self, other: &dyn Aggregator);
	/// Appends the current state to an archive.
	fn serialize(&self, ar: &mut Archive);
	/// Replaces the current state with one read from an archive.
	fn deserialize(&mut self, ar: &mut Archive) -> Result<(), ArchiveError>;
	/// Renders the value for reports; `None` when not representable.
	fn try_to_string(&self) -> Option<String>;
	/// Downcast support for [`Aggregator::merge`].
	fn as_any(&self) -> &dyn Any;
}

/// Typed extension: how user values enter an aggregator.
pub trait Aggregate: Aggregator + Default {
	/// The value type callers write.
	type Value;
	/// Absorbs one value.
	fn merge_value(&mut self, value: Self::Value);
}

/// The stable wire name of an aggregator type.
#[must_use]
pub fn aggregator_type_name<A: 'static>() -> &'static str {
	std::any::type_name::<A>()
}

type Constructor = Box<dyn Fn() -> Box<dyn Aggregator> + Send + Sync>;

/// Wire type name → constructor. Passed explicitly to the client and
/// server; both sides must register the same concrete types.
#[derive(Default)]
pub struct AggregatorRegistry {
	ctors: Mutex<HashMap<String, Constructor>>,
}

impl std::fmt::Debug for AggregatorRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let ctors = self.ctors.lock().unwrap();
		f.debug_struct("AggregatorRegistry")
			.field("types", &ctors.len())
			.finish()
	}
}

impl AggregatorRegistry {
	/// Creates an empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `A` under its type name.
	pub fn register<A: Aggregator + Default>(&self) {
		self.ctors.lock().unwrap().insert(
			aggregator_type_name::<A>().to_string(),
			Box::new(|| Box::new(A::default())),
		);
	}

	/// Instantiates an aggregator from its wire type name.
	#[must_use]
	pub fn create(&self, type_name: &str) -> Option<Box<dyn Aggregator>> {
		let ctors = self.ctors.lock().unwrap();
		let ctor = ctors.get(type_name)?;
		let mut agg = ctor();
		agg.init();
		Some(agg)
	}
}

fn downcast_or_warn<'a, A: Aggregator>(other: &'a dyn Aggregator) -> Option<&'a A> {
	let cast = other.as_any().downcast_ref::<A>();
	if cast.is_none() {
		tracing::error!(
			expected = aggregator_type_name::<A>(),
			"merging mismatched aggregator types"
		);
	}
	cast
}

/// Running sum.
#[derive(Debug, Clone, Default)]
pub struct SumAggregator<T> {
	value: T,
}

impl<T> SumAggregator<T> {
	/// The accumulated sum.
	pub fn value(&self) -> &T {
		&self.value
	}
}

impl<T> Aggregator for SumAggregator<T>
where
	T: ArchiveValue + AddAssign + Clone + Default + ToString + Send + 'static,
{
	fn init(&mut self) {
		self.value = T::default();
	}

	fn merge(&mut self, other: &dyn Aggregator) {
		if let Some(other) = downcast_or_warn::<Self>(other) {
			self.value += other.value.clone();
		}
	}

	fn serialize(&self, ar: &mut Archive) {
		ar.put(&self.value);
	}

	fn deserialize(&mut self, ar: &mut Archive) -> Result<(), ArchiveError> {
		self.value = ar.get()?;
		Ok(())
	}

	fn try_to_string(&self) -> Option<String> {
		Some(self.value.to_string())
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

impl<T> Aggregate for SumAggregator<T>
where
	T: ArchiveValue + AddAssign + Clone + Default + ToString + Send + 'static,
{
	type Value = T;

	fn merge_value(&mut self, value: T) {
		self.value += value;
	}
}

macro_rules! extremum_aggregator {
	($name:ident, $doc:literal, $keep:expr) => {
		#[doc = $doc]
		#[derive(Debug, Clone, Default)]
		pub struct $name<T> {
			value: Option<T>,
		}

		impl<T> $name<T> {
			/// The current extremum; `None` before any value arrived.
			pub fn value(&self) -> Option<&T> {
				self.value.as_ref()
			}
		}

		impl<T> Aggregator for $name<T>
		where
			T: ArchiveValue + PartialOrd + Clone + ToString + Send + Default + 'static,
		{
			fn init(&mut self) {
				self.value = None;
			}

			fn merge(&mut self, other: &dyn Aggregator) {
				if let Some(other) = downcast_or_warn::<Self>(other) {
					if let Some(v) = other.value.clone() {
						self.merge_value(v);
					}
				}
			}

			fn serialize(&self, ar: &mut Archive) {
				match &self.value {
					Some(v) => {
						ar.put(&true);
						ar.put(v);
					}
					None => ar.put(&false),
				}
			}

			fn deserialize(&mut self, ar: &mut Archive) -> Result<(), ArchiveError> {
				self.value = if ar.get::<bool>()? {
					Some(ar.get::<T>()?)
				} else {
					None
				};
				Ok(())
			}

			fn try_to_string(&self) -> Option<String> {
				Some(match &self.value {
					Some(v) => v.to_string(),
					None => "N/A".to_string(),
				})
			}

			fn as_any(&self) -> &dyn Any {
				self
			}
		}

		impl<T> Aggregate for $name<T>
		where
			T: ArchiveValue + PartialOrd + Clone + ToString + Send + Default + 'static,
		{
			type Value = T;

			fn merge_value(&mut self, value: T) {
				let keep: fn(&T, &T) -> bool = $keep;
				match &self.value {
					Some(current) if keep(current, &value) => {}
					_ => self.value = Some(value),
				}
			}
		}
	};
}

extremum_aggregator!(MinAggregator, "Running minimum.", |current, new| current <= new);
extremum_aggregator!(MaxAggregator, "Running maximum.", |current, new| current >= new);

/// Running average: sum plus sample count.
#[derive(Debug, Clone, Default)]
pub struct AvgAggregator<T> {
	value: T,
	count: u64,
}

impl<T> AvgAggregator<T>
where
	T: Into<f64> + Copy,
{
	/// The mean of everything written so far; `None` before any value.
	pub fn average(&self) -> Option<f64> {
		if self.count == 0 {
			None
		} else {
			Some(self.value.into() / self.count as f64)
		}
	}
}

impl<T> Aggregator for AvgAggregator<T>
where
	T: ArchiveValue + AddAssign + Into<f64> + Copy + Default + Send + 'static,
{
	fn init(&mut self) {
		self.value = T::default();
		self.count = 0;
	}

	fn merge(&mut self, other: &dyn Aggregator) {
		if let Some(other) = downcast_or_warn::<Self>(other) {
			self.value += other.value;
			self.count += other.count;
		}
	}

	fn serialize(&self, ar: &mut Archive) {
		ar.put(&self.value);
		ar.put(&self.count);
	}

	fn deserialize(&mut self, ar: &mut Archive) -> Result<(), ArchiveError> {
		self.value = ar.get()?;
		self.count = ar.get()?;
		Ok(())
	}

	fn try_to_string(&self) -> Option<String> {
		Some(match self.average() {
			Some(avg) => avg.to_string(),
			None => "N/A".to_string(),
		})
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

impl<T> Aggregate for AvgAggregator<T>
where
	T: ArchiveValue + AddAssign + Into<f64> + Copy + Default + Send + 'static,
{
	type Value = T;

	fn merge_value(&mut self, value: T) {
		self.value += value;
		self.count += 1;
	}
}
