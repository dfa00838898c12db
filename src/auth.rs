use actix_web::{
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use chrono::{Duration, Utc};
use futures_util::future::{ok, Ready as FutureReady};
use jsonwebtoken::{
    decode, encode, errors::Error as JwtError, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::debug;

use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Id of the user the token was issued for.
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// Requester identity placed in request extensions by [`AuthMiddleware`].
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        JwtKeys {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

pub fn issue_token(user_id: &str, keys: &JwtKeys, ttl: Duration) -> Result<String, JwtError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
    };

    encode(&Header::default(), &claims, &keys.encoding)
}

pub fn verify_token(token: &str, keys: &JwtKeys) -> Result<Claims, JwtError> {
    let token_data = decode::<Claims>(token, &keys.decoding, &Validation::default())?;
    Ok(token_data.claims)
}

fn bearer_token(req: &ServiceRequest) -> Result<&str, ApiError> {
    let header = req
        .headers()
        .get("Authorization")
        .ok_or_else(|| ApiError::Unauthenticated("No authorization header".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| ApiError::Unauthenticated("Invalid authorization header".to_string()))?;

    value.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::Unauthenticated("Invalid authorization header format".to_string())
    })
}

/// Rejects requests without a valid bearer token and records the token's
/// subject as the [`AuthenticatedUser`].
pub struct AuthMiddleware {
    keys: Arc<JwtKeys>,
}

impl AuthMiddleware {
    pub fn new(keys: Arc<JwtKeys>) -> Self {
        AuthMiddleware { keys }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddlewareService<S>;
    type Future = FutureReady<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddlewareService {
            service,
            keys: self.keys.clone(),
        })
    }
}

pub struct AuthMiddlewareService<S> {
    service: S,
    keys: Arc<JwtKeys>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let claims = bearer_token(&req).and_then(|token| {
            verify_token(token, &self.keys).map_err(|e| {
                debug!("Rejected bearer token: {}", e);
                ApiError::Unauthenticated("Invalid token".to_string())
            })
        });

        match claims {
            Ok(claims) => {
                req.extensions_mut().insert(AuthenticatedUser { id: claims.sub });
                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            Err(err) => Box::pin(async move { Err(err.into()) }),
        }
    }
}
