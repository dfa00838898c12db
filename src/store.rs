use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, from_document, oid::ObjectId, Bson, Document},
    options::{FindOneAndUpdateOptions, ReturnDocument},
    Collection, Database,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::{Category, CategorySummary, NewProduct, Product, ProductChanges, ProductListing, User};

const PRODUCTS: &str = "products";
const CATEGORIES: &str = "categories";
const USERS: &str = "users";
const COUNTERS: &str = "counters";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("malformed document: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("id sequence {0} could not be advanced")]
    Counter(&'static str),

    #[error("category {0} does not exist")]
    UnknownCategory(i64),
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Persists a product, assigning its id. Fails with `UnknownCategory` if
    /// `category_id` names no category.
    async fn create(&self, product: NewProduct) -> Result<Product, StoreError>;

    /// Every product joined with its category's id and name.
    async fn find_all_with_category(&self) -> Result<Vec<ProductListing>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Product>, StoreError>;

    /// Applies the present fields of `changes`. Returns `false` when no
    /// product has this id.
    async fn update(&self, id: i64, changes: ProductChanges) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Unknown users are not admins.
    async fn is_admin(&self, user_id: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ProductDocument {
    #[serde(rename = "_id")]
    id: i64,
    name: String,
    price: f64,
    category_id: i64,
    #[serde(default)]
    offer: bool,
    path: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductDocument> for Product {
    fn from(document: ProductDocument) -> Self {
        Product {
            id: document.id,
            name: document.name,
            price: document.price,
            category_id: document.category_id,
            offer: document.offer,
            path: document.path,
            created_at: document.created_at,
            updated_at: document.updated_at,
        }
    }
}

impl From<&Product> for ProductDocument {
    fn from(product: &Product) -> Self {
        ProductDocument {
            id: product.id,
            name: product.name.clone(),
            price: product.price,
            category_id: product.category_id,
            offer: product.offer,
            path: product.path.clone(),
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }
}

/// Splits one joined row into the product and its category summary. Rows
/// whose category is gone carry no `category` field.
fn decode_listing(mut document: Document) -> Result<ProductListing, StoreError> {
    let category = match document.remove("category") {
        Some(Bson::Document(category)) => {
            let category: Category = from_document(category)?;
            Some(CategorySummary::from(&category))
        }
        _ => None,
    };
    let product: ProductDocument = from_document(document)?;

    Ok(ProductListing {
        product: product.into(),
        category,
    })
}

pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    pub fn new(database: Database) -> Self {
        MongoStore { database }
    }

    fn products(&self) -> Collection<ProductDocument> {
        self.database.collection(PRODUCTS)
    }

    async fn next_id(&self, sequence: &'static str) -> Result<i64, StoreError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let counter = self
            .database
            .collection::<Document>(COUNTERS)
            .find_one_and_update(
                doc! { "_id": sequence },
                doc! { "$inc": { "seq": 1_i64 } },
                options,
            )
            .await?
            .ok_or(StoreError::Counter(sequence))?;

        counter.get_i64("seq").map_err(|_| StoreError::Counter(sequence))
    }

    async fn ensure_category(&self, category_id: i64) -> Result<(), StoreError> {
        let count = self
            .database
            .collection::<Document>(CATEGORIES)
            .count_documents(doc! { "_id": category_id }, None)
            .await?;

        if count == 0 {
            return Err(StoreError::UnknownCategory(category_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ProductStore for MongoStore {
    async fn create(&self, new_product: NewProduct) -> Result<Product, StoreError> {
        self.ensure_category(new_product.category_id).await?;

        let now = Utc::now();
        let product = Product {
            id: self.next_id(PRODUCTS).await?,
            name: new_product.name,
            price: new_product.price,
            category_id: new_product.category_id,
            offer: new_product.offer,
            path: new_product.path,
            created_at: now,
            updated_at: now,
        };

        self.products()
            .insert_one(ProductDocument::from(&product), None)
            .await?;

        debug!("Inserted product document {}", product.id);
        Ok(product)
    }

    async fn find_all_with_category(&self) -> Result<Vec<ProductListing>, StoreError> {
        let pipeline = vec![
            doc! { "$sort": { "_id": 1 } },
            doc! { "$lookup": {
                "from": CATEGORIES,
                "localField": "category_id",
                "foreignField": "_id",
                "as": "category",
            } },
            doc! { "$unwind": { "path": "$category", "preserveNullAndEmptyArrays": true } },
            doc! { "$project": {
                "name": 1,
                "price": 1,
                "category_id": 1,
                "offer": 1,
                "path": 1,
                "created_at": 1,
                "updated_at": 1,
                "category._id": 1,
                "category.name": 1,
            } },
        ];

        let mut cursor = self.products().aggregate(pipeline, None).await?;
        let mut listings = Vec::new();

        while let Some(document) = cursor.try_next().await? {
            listings.push(decode_listing(document)?);
        }

        Ok(listings)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Product>, StoreError> {
        let product = self.products().find_one(doc! { "_id": id }, None).await?;
        Ok(product.map(Product::from))
    }

    async fn update(&self, id: i64, changes: ProductChanges) -> Result<bool, StoreError> {
        if let Some(category_id) = changes.category_id {
            self.ensure_category(category_id).await?;
        }

        let mut set = doc! { "updated_at": Utc::now().to_rfc3339() };
        if let Some(name) = changes.name {
            set.insert("name", name);
        }
        if let Some(price) = changes.price {
            set.insert("price", price);
        }
        if let Some(category_id) = changes.category_id {
            set.insert("category_id", category_id);
        }
        if let Some(offer) = changes.offer {
            set.insert("offer", offer);
        }
        if let Some(path) = changes.path {
            set.insert("path", path);
        }

        let result = self
            .products()
            .update_one(doc! { "_id": id }, doc! { "$set": set }, None)
            .await?;

        Ok(result.matched_count > 0)
    }
}

#[async_trait]
impl UserStore for MongoStore {
    async fn is_admin(&self, user_id: &str) -> Result<bool, StoreError> {
        let object_id = match ObjectId::parse_str(user_id) {
            Ok(object_id) => object_id,
            Err(_) => {
                debug!("User id {} is not an ObjectId", user_id);
                return Ok(false);
            }
        };

        let user = self
            .database
            .collection::<User>(USERS)
            .find_one(doc! { "_id": object_id }, None)
            .await?;

        Ok(user.map(|user| user.admin).unwrap_or(false))
    }
}
