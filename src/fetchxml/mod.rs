//! The FetchXML document model and its serializer (spec §3, §4.2, §6.3).

pub mod model;
pub mod writer;

pub use model::{
    AggregateFunction, Attribute, Condition, DateGrouping, Entity, Fetch, Filter, FilterItem,
    FilterType, Item, LinkEntity, LinkType, Order,
};
pub use writer::write_fetch;
