use actix_web::{web, HttpRequest, HttpResponse};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthMiddleware, AuthenticatedUser, JwtKeys},
    error::ApiError,
    store::{ProductStore, UserStore},
    upload::{read_submission, UploadStorage, FILE_FIELD},
    validation::{CreateProductForm, UpdateProductForm},
};

pub fn configure(cfg: &mut web::ServiceConfig, keys: Arc<JwtKeys>) {
    cfg.service(
        web::scope("/products")
            .wrap(AuthMiddleware::new(keys))
            .route("", web::post().to(store_product))
            .route("", web::get().to(list_products))
            .route("/{id}", web::put().to(update_product)),
    );
}

async fn require_admin(users: &dyn UserStore, user: &AuthenticatedUser) -> Result<(), ApiError> {
    if users.is_admin(&user.id).await? {
        Ok(())
    } else {
        warn!("User {} is not allowed to manage products", user.id);
        Err(ApiError::NotAdmin)
    }
}

pub async fn store_product(
    req: HttpRequest,
    payload: web::Payload,
    user: web::ReqData<AuthenticatedUser>,
    products: web::Data<dyn ProductStore>,
    users: web::Data<dyn UserStore>,
    uploads: web::Data<UploadStorage>,
) -> Result<HttpResponse, ApiError> {
    let submission = read_submission(&req, payload, uploads.max_bytes()).await?;
    let form = CreateProductForm::from_fields(submission.fields)
        .with_mistyped(submission.mistyped);

    debug!("Creating new product: {:?}", form);

    let mut violations = form.violations();
    let file = match submission.file {
        Some(file) if violations.is_empty() => file,
        file => {
            if file.is_none() {
                violations.push(format!("{} is a required field", FILE_FIELD));
            }
            debug!("Rejected product: {:?}", violations);
            return Err(ApiError::Validation(violations));
        }
    };

    require_admin(users.get_ref(), &user).await?;

    let path = uploads.save(&file).await.map_err(|e| {
        error!("Failed to store upload {}: {}", file.original_name, e);
        ApiError::from(e)
    })?;

    let new_product = match form.into_new_product(path.clone()) {
        Some(new_product) => new_product,
        None => {
            uploads.remove(&path).await;
            return Err(ApiError::Validation(vec![
                "product fields could not be parsed".to_string(),
            ]));
        }
    };

    match products.create(new_product).await {
        Ok(product) => {
            info!("Product created successfully with ID: {}", product.id);
            Ok(HttpResponse::Ok().json(product))
        }
        Err(e) => {
            uploads.remove(&path).await;
            Err(e.into())
        }
    }
}

pub async fn list_products(
    products: web::Data<dyn ProductStore>,
) -> Result<HttpResponse, ApiError> {
    debug!("Fetching products");

    let listings = products.find_all_with_category().await?;

    info!("Retrieved {} products", listings.len());
    Ok(HttpResponse::Ok().json(listings))
}

pub async fn update_product(
    req: HttpRequest,
    payload: web::Payload,
    id: web::Path<String>,
    user: web::ReqData<AuthenticatedUser>,
    products: web::Data<dyn ProductStore>,
    users: web::Data<dyn UserStore>,
    uploads: web::Data<UploadStorage>,
) -> Result<HttpResponse, ApiError> {
    let submission = read_submission(&req, payload, uploads.max_bytes()).await?;
    let form = UpdateProductForm::from_fields(submission.fields)
        .with_mistyped(submission.mistyped);

    debug!("Updating product {}: {:?}", id, form);

    let violations = form.violations();
    if !violations.is_empty() {
        debug!("Rejected update of {}: {:?}", id, violations);
        return Err(ApiError::Validation(violations));
    }

    require_admin(users.get_ref(), &user).await?;

    let product_id = match id.parse::<i64>() {
        Ok(product_id) => product_id,
        Err(_) => {
            debug!("Product not found for update: {}", id);
            return Err(ApiError::ProductNotFound(id.into_inner()));
        }
    };
    if products.find_by_id(product_id).await?.is_none() {
        debug!("Product not found for update: {}", id);
        return Err(ApiError::ProductNotFound(id.into_inner()));
    }

    let path = match &submission.file {
        Some(file) => Some(uploads.save(file).await.map_err(|e| {
            error!("Failed to store upload {}: {}", file.original_name, e);
            ApiError::from(e)
        })?),
        None => None,
    };

    let outcome = products
        .update(product_id, form.into_changes(path.clone()))
        .await;

    match outcome {
        Ok(true) => {
            info!("Product updated successfully: {}", product_id);
            Ok(HttpResponse::Ok().finish())
        }
        Ok(false) => {
            if let Some(path) = &path {
                uploads.remove(path).await;
            }
            debug!("Product disappeared during update: {}", product_id);
            Err(ApiError::ProductNotFound(id.into_inner()))
        }
        Err(e) => {
            if let Some(path) = &path {
                uploads.remove(path).await;
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::issue_token,
        error::PRODUCT_NOT_FOUND_MESSAGE,
        models::NewProduct,
        store::memory::MemoryStore,
    };
    use actix_web::{
        dev::Service,
        http::{header, StatusCode},
        test, App, ResponseError,
    };
    use chrono::Duration;
    use std::path::Path;

    const SECRET: &[u8] = b"test-secret";
    const ADMIN: &str = "admin-1";
    const CUSTOMER: &str = "customer-1";
    const BOUNDARY: &str = "catalog-test-boundary";

    macro_rules! test_app {
        ($store:expr, $dir:expr) => {
            test_app!($store, $dir, 1024 * 1024)
        };
        ($store:expr, $dir:expr, $limit:expr) => {{
            let products: Arc<dyn ProductStore> = $store.clone();
            let users: Arc<dyn UserStore> = $store.clone();
            let keys = Arc::new(JwtKeys::from_secret(SECRET));
            test::init_service(
                App::new()
                    .app_data(web::Data::from(products))
                    .app_data(web::Data::from(users))
                    .app_data(web::Data::new(UploadStorage::new($dir, $limit)))
                    .configure(|cfg| configure(cfg, keys)),
            )
            .await
        }};
    }

    fn seeded_store() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::default()
                .with_category(1, "Burgers")
                .with_category(2, "Drinks")
                .with_user(ADMIN, true)
                .with_user(CUSTOMER, false),
        )
    }

    fn bearer(user_id: &str) -> (header::HeaderName, String) {
        let token = issue_token(user_id, &JwtKeys::from_secret(SECRET), Duration::hours(1)).unwrap();
        (header::AUTHORIZATION, format!("Bearer {}", token))
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some((filename, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY, filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(
        req: test::TestRequest,
        user_id: &str,
        fields: &[(&str, &str)],
        file: Option<(&str, &[u8])>,
    ) -> test::TestRequest {
        req.insert_header(bearer(user_id))
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(multipart_body(fields, file))
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    async fn seed_product(store: &MemoryStore) -> i64 {
        store
            .create(NewProduct {
                name: "X-Bacon".to_string(),
                price: 18.0,
                category_id: 1,
                offer: false,
                path: "bacon.png".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[actix_web::test]
    async fn create_without_name_reports_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            ADMIN,
            &[("price", "10"), ("category_id", "1")],
            Some(("burger.png", b"png".as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!({ "error": ["name is a required field"] }));
        assert!(store.products().is_empty());
    }

    #[actix_web::test]
    async fn create_collects_all_violations_including_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            ADMIN,
            &[("price", "free"), ("offer", "perhaps")],
            None,
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(
            body["error"],
            serde_json::json!([
                "name is a required field",
                "price must be a `number` type",
                "category_id is a required field",
                "offer must be a `boolean` type",
                "file is a required field",
            ])
        );
    }

    #[actix_web::test]
    async fn create_by_non_admin_is_unauthorized_and_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            CUSTOMER,
            &[("name", "X-Tudo"), ("price", "25.9"), ("category_id", "1")],
            Some(("tudo.png", b"png".as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(test::read_body(resp).await.is_empty());
        assert!(store.products().is_empty());
        assert!(dir_is_empty(dir.path()));
    }

    #[actix_web::test]
    async fn create_by_admin_returns_product_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            ADMIN,
            &[
                ("name", "X-Tudo"),
                ("price", "25.9"),
                ("category_id", "1"),
                ("offer", "true"),
            ],
            Some(("tudo.PNG", b"png-bytes".as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["name"], "X-Tudo");
        assert_eq!(body["price"], 25.9);
        assert_eq!(body["category_id"], 1);
        assert_eq!(body["offer"], true);

        let path = body["path"].as_str().unwrap();
        assert!(path.ends_with(".png"));
        assert_eq!(std::fs::read(dir.path().join(path)).unwrap(), b"png-bytes");

        let stored = store.products();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].path, path);
    }

    #[actix_web::test]
    async fn create_with_unknown_category_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            ADMIN,
            &[("name", "Soup"), ("price", "9"), ("category_id", "99")],
            Some(("soup.png", b"png".as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.products().is_empty());
        assert!(dir_is_empty(dir.path()));
    }

    #[actix_web::test]
    async fn list_reduces_category_to_id_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::get()
            .uri("/products")
            .insert_header(bearer(CUSTOMER))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let listings = body.as_array().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0]["name"], "X-Bacon");
        assert_eq!(
            listings[0]["category"],
            serde_json::json!({ "id": 1, "name": "Burgers" })
        );
    }

    #[actix_web::test]
    async fn update_unknown_product_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri("/products/404")
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "price": 10 }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!({ "error": PRODUCT_NOT_FOUND_MESSAGE }));
    }

    #[actix_web::test]
    async fn partial_update_leaves_other_fields_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri(&format!("/products/{}", id))
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "price": 21.5 }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(test::read_body(resp).await.is_empty());

        let product = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(product.price, 21.5);
        assert_eq!(product.name, "X-Bacon");
        assert_eq!(product.category_id, 1);
        assert_eq!(product.path, "bacon.png");
        assert!(!product.offer);
    }

    #[actix_web::test]
    async fn update_with_file_replaces_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = multipart_request(
            test::TestRequest::put().uri(&format!("/products/{}", id)),
            ADMIN,
            &[("category_id", "2"), ("offer", "1")],
            Some(("new.jpg", b"jpg".as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let product = store.find_by_id(id).await.unwrap().unwrap();
        assert_ne!(product.path, "bacon.png");
        assert!(product.path.ends_with(".jpg"));
        assert!(dir.path().join(&product.path).exists());
        assert_eq!(product.category_id, 2);
        assert!(product.offer);
        assert_eq!(product.name, "X-Bacon");
    }

    #[actix_web::test]
    async fn update_rejects_wrong_types() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri(&format!("/products/{}", id))
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "price": "expensive", "offer": "nope" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(
            body["error"],
            serde_json::json!(["price must be a `number` type", "offer must be a `boolean` type"])
        );
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().price, 18.0);
    }

    #[actix_web::test]
    async fn update_by_non_admin_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri(&format!("/products/{}", id))
            .insert_header(bearer(CUSTOMER))
            .set_json(serde_json::json!({ "name": "Hacked" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(test::read_body(resp).await.is_empty());
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().name, "X-Bacon");
    }

    #[actix_web::test]
    async fn create_rejects_object_valued_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::post()
            .uri("/products")
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "name": { "x": 1 }, "price": 10, "category_id": 1 }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(
            body["error"],
            serde_json::json!(["name must be a `string` type", "file is a required field"])
        );
        assert!(store.products().is_empty());
    }

    #[actix_web::test]
    async fn update_rejects_object_valued_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri(&format!("/products/{}", id))
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "name": { "x": 1 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], serde_json::json!(["name must be a `string` type"]));
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().name, "X-Bacon");
    }

    #[actix_web::test]
    async fn oversized_multipart_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path(), 64);

        let image = vec![0u8; 1024];
        let req = multipart_request(
            test::TestRequest::post().uri("/products"),
            ADMIN,
            &[("name", "Giant"), ("price", "1"), ("category_id", "1")],
            Some(("giant.png", image.as_slice())),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["error"].is_string());
        assert!(store.products().is_empty());
        assert!(dir_is_empty(dir.path()));
    }

    #[actix_web::test]
    async fn oversized_json_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let id = seed_product(&store).await;
        let app = test_app!(store, dir.path(), 64);

        let req = test::TestRequest::put()
            .uri(&format!("/products/{}", id))
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "name": "x".repeat(200) }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().name, "X-Bacon");
    }

    #[actix_web::test]
    async fn update_with_non_numeric_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::put()
            .uri("/products/abc")
            .insert_header(bearer(ADMIN))
            .set_json(serde_json::json!({ "price": 3 }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!({ "error": PRODUCT_NOT_FOUND_MESSAGE }));
    }

    #[actix_web::test]
    async fn list_shows_missing_category_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        seed_product(&store).await;
        store.remove_category(1);
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::get()
            .uri("/products")
            .insert_header(bearer(ADMIN))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body[0]["name"], "X-Bacon");
        assert!(body[0]["category"].is_null());
    }

    #[actix_web::test]
    async fn requests_without_token_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store();
        let app = test_app!(store, dir.path());

        let req = test::TestRequest::get().uri("/products").to_request();
        let err = match app.call(req).await {
            Ok(_) => panic!("request without a token was accepted"),
            Err(err) => err,
        };

        assert_eq!(
            err.as_response_error().status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
