//! `millwright-goods` — finished-goods catalog domain.

pub mod catalog;

pub use catalog::{
    CatalogCommand, CatalogEvent, FinishedGoodsCatalog, FinishedGoodsCatalogId, FinishedGoodsId,
    FinishedGoodsItem, ItemPublished, PublishItem,
};
