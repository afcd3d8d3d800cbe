//! Catalog reconcilers: products and collections.
//!
//! Each reconciler subscribes to exactly its domain's event names and
//! releases every subscription when dropped, so a table or editor that
//! unmounts leaves nothing behind in the multiplexer. The product
//! reconciler backs both the product list and the inventory table; the
//! inventory view is a filter over the same snapshot.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::{Collection, EventName, Product, ProductPatch, ServerEvent};
use crate::mux::{EventMux, Subscription};
use crate::reconcile::{EntityPatch, EntityRecord, EntitySet, OrderPolicy};

impl EntityRecord for Product {
    fn id(&self) -> &str {
        &self.id
    }
}

impl EntityRecord for Collection {
    fn id(&self) -> &str {
        &self.id
    }
}

impl EntityPatch for ProductPatch {
    type Record = Product;

    fn id(&self) -> &str {
        &self.id
    }

    fn apply_to(&self, record: &mut Product) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(stock) = self.stock {
            record.stock = stock;
        }
        if let Some(price) = self.price {
            record.price = price;
        }
        if let Some(category) = &self.category {
            record.category = Some(category.clone());
        }
        if let Some(image_url) = &self.image_url {
            record.image_url = Some(image_url.clone());
        }
    }

    fn into_record(self) -> Product {
        Product {
            id: self.id,
            name: self.name.unwrap_or_default(),
            stock: self.stock.unwrap_or_default(),
            price: self.price.unwrap_or_default(),
            category: self.category,
            image_url: self.image_url,
        }
    }
}

// ============================================================================
// Products
// ============================================================================

/// Folds `PRODUCT_*` events into a locally held product collection.
pub struct ProductReconciler {
    set: Arc<RwLock<EntitySet<Product>>>,
    _subs: Vec<Subscription>,
}

impl ProductReconciler {
    /// Subscribe to the product event names on `mux`. The subscriptions
    /// live as long as the reconciler.
    pub fn attach(mux: &EventMux) -> Self {
        let set = Arc::new(RwLock::new(EntitySet::new(OrderPolicy::ReplaceInPlace)));

        let created = set.clone();
        let updated = set.clone();
        let deleted = set.clone();
        let subs = vec![
            mux.on(EventName::ProductCreated, move |event| {
                if let ServerEvent::ProductCreated(product) = event {
                    created.write().upsert(product.clone());
                }
            }),
            mux.on(EventName::ProductUpdated, move |event| {
                if let ServerEvent::ProductUpdated(patch) = event {
                    updated.write().merge(patch.clone());
                }
            }),
            mux.on(EventName::ProductDeleted, move |event| {
                if let ServerEvent::ProductDeleted(entity) = event {
                    deleted.write().remove(&entity.id);
                }
            }),
        ];

        Self { set, _subs: subs }
    }

    /// Replace the collection wholesale (baseline from an HTTP refetch,
    /// e.g. after a reconnect).
    pub fn seed(&self, products: Vec<Product>) {
        self.set.write().replace_all(products);
    }

    pub fn snapshot(&self) -> Vec<Product> {
        self.set.read().snapshot()
    }

    pub fn get(&self, id: &str) -> Option<Product> {
        self.set.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }

    /// Products at or below the given stock level (inventory table view).
    pub fn low_stock(&self, threshold: i64) -> Vec<Product> {
        self.set
            .read()
            .iter()
            .filter(|p| p.stock <= threshold)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Collections
// ============================================================================

/// Folds `COLLECTION_*` events into a locally held collection list.
/// Update frames carry the full payload, so updates are whole-record
/// replacements in place.
pub struct CollectionReconciler {
    set: Arc<RwLock<EntitySet<Collection>>>,
    _subs: Vec<Subscription>,
}

impl CollectionReconciler {
    pub fn attach(mux: &EventMux) -> Self {
        let set = Arc::new(RwLock::new(EntitySet::new(OrderPolicy::ReplaceInPlace)));

        let created = set.clone();
        let updated = set.clone();
        let deleted = set.clone();
        let subs = vec![
            mux.on(EventName::CollectionCreated, move |event| {
                if let ServerEvent::CollectionCreated(collection) = event {
                    created.write().upsert(collection.clone());
                }
            }),
            mux.on(EventName::CollectionUpdated, move |event| {
                if let ServerEvent::CollectionUpdated(collection) = event {
                    updated.write().upsert(collection.clone());
                }
            }),
            mux.on(EventName::CollectionDeleted, move |event| {
                if let ServerEvent::CollectionDeleted(collection) = event {
                    deleted.write().remove(&collection.id);
                }
            }),
        ];

        Self { set, _subs: subs }
    }

    pub fn seed(&self, collections: Vec<Collection>) {
        self.set.write().replace_all(collections);
    }

    pub fn snapshot(&self) -> Vec<Collection> {
        self.set.read().snapshot()
    }

    pub fn get(&self, id: &str) -> Option<Collection> {
        self.set.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
