use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{EntityKind, OrderCreated, ProductCreated};
use crate::store::{ReplicaStore, StoreError};
use crate::sync::ReplicaRecord;

// ============================================================================
// Seller Dashboard - local reads over replicas
// ============================================================================
//
// Joins order items to product replicas by product id and keeps the items
// whose product belongs to the seller. Nothing here calls another service;
// a replica that has not arrived yet simply does not count.
//
// ============================================================================

const TOP_PRODUCTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopProduct {
    pub product_id: String,
    pub name: String,
    pub image: Option<String>,
    pub total_sold: i64,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SellerMetrics {
    pub sales: i64,
    pub revenue: f64,
    pub top_products: Vec<TopProduct>,
}

pub struct SellerDashboard {
    store: Arc<dyn ReplicaStore>,
}

impl SellerDashboard {
    pub fn new(store: Arc<dyn ReplicaStore>) -> Self {
        Self { store }
    }

    /// Units sold, revenue and best sellers across every order line for the
    /// seller's products.
    pub async fn metrics(&self, seller: &str) -> Result<SellerMetrics, StoreError> {
        let products: HashMap<String, ProductCreated> = self
            .seller_products(seller)
            .await?
            .into_iter()
            .map(|(record, product)| (record.id.as_str().to_string(), product))
            .collect();

        let mut sales = 0;
        let mut revenue = 0.0;
        let mut per_product: HashMap<String, TopProduct> = HashMap::new();

        for (_, order) in decoded::<OrderCreated>(self.store.list(EntityKind::Order).await?) {
            for item in order.items {
                let Some(product) = products.get(&item.product_id) else {
                    continue;
                };
                let line = item.price * item.qty as f64;
                sales += item.qty;
                revenue += line;

                let entry = per_product.entry(item.product_id.clone()).or_insert_with(|| TopProduct {
                    product_id: item.product_id.clone(),
                    name: product.title.clone(),
                    image: product.images.first().and_then(|image| image.url.clone()),
                    total_sold: 0,
                    revenue: 0.0,
                });
                entry.total_sold += item.qty;
                entry.revenue += line;
            }
        }

        let mut top_products: Vec<TopProduct> = per_product.into_values().collect();
        top_products.sort_by(|a, b| {
            b.total_sold
                .cmp(&a.total_sold)
                .then_with(|| a.product_id.cmp(&b.product_id))
        });
        top_products.truncate(TOP_PRODUCTS);

        Ok(SellerMetrics {
            sales,
            revenue,
            top_products,
        })
    }

    /// The seller's product replicas, newest first.
    pub async fn products(&self, seller: &str) -> Result<Vec<ReplicaRecord>, StoreError> {
        let mut products: Vec<ReplicaRecord> = self
            .seller_products(seller)
            .await?
            .into_iter()
            .map(|(record, _)| record)
            .collect();
        newest_first(&mut products);
        Ok(products)
    }

    /// Orders containing at least one of the seller's products, newest first.
    pub async fn orders(&self, seller: &str) -> Result<Vec<ReplicaRecord>, StoreError> {
        let product_ids: HashSet<String> = self
            .seller_products(seller)
            .await?
            .into_iter()
            .map(|(record, _)| record.id.as_str().to_string())
            .collect();

        let mut orders: Vec<ReplicaRecord> = decoded::<OrderCreated>(self.store.list(EntityKind::Order).await?)
            .into_iter()
            .filter(|(_, order)| order.items.iter().any(|item| product_ids.contains(&item.product_id)))
            .map(|(record, _)| record)
            .collect();
        newest_first(&mut orders);
        Ok(orders)
    }

    async fn seller_products(&self, seller: &str) -> Result<Vec<(ReplicaRecord, ProductCreated)>, StoreError> {
        Ok(decoded::<ProductCreated>(self.store.list(EntityKind::Product).await?)
            .into_iter()
            .filter(|(_, product)| product.seller == seller)
            .collect())
    }
}

fn decoded<T: DeserializeOwned>(records: Vec<ReplicaRecord>) -> Vec<(ReplicaRecord, T)> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<T>(record.document.clone()) {
            Ok(typed) => Some((record, typed)),
            Err(e) => {
                tracing::warn!(kind = %record.kind, id = %record.id, error = %e, "Skipping unreadable replica");
                None
            }
        })
        .collect()
}

fn newest_first(records: &mut [ReplicaRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
}
