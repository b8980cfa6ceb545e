//! Marketplace HTTP client.
//!
//! The only authority on offer prices and the sink for placed bids.
//! Everything the engine needs sits behind the `Marketplace` trait so
//! the scheduler and counter-bid paths run against mocks in tests.
//!
//! Transaction-template signing is an external concern behind
//! `OfferSigner`; without a signer the client runs in dry-run mode and
//! logs the offers it would have placed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::models::Listing;
use crate::wallets::pool::WalletHandle;

/// Hard deadline for every marketplace call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Inner-loop bound for "offer already exists" idempotency retries.
const MAX_RETRIES: usize = 3;

/// Spacing between idempotency retries.
const RETRY_SPACING: Duration = Duration::from_millis(2_500);

const ALREADY_HAVE_ITEM_OFFER: &str = "You already have an offer for this token";
const ONLY_ONE_COLLECTION_OFFER: &str = "Only 1 collection offer allowed per collection";

/// A competitor's (or our own) offer on a specific token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOffer {
    #[serde(default)]
    pub id: Option<String>,
    pub price: u64,
    pub buyer_payment_address: String,
    #[serde(default)]
    pub expiration_date: Option<i64>,
}

/// The best live collection-wide offer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOfferView {
    #[serde(default)]
    pub id: Option<String>,
    pub price: u64,
    #[serde(default)]
    pub buyer_payment_address: Option<String>,
}

/// A successfully submitted offer.
#[derive(Debug, Clone)]
pub struct PlacedOffer {
    pub offer_id: Option<String>,
    pub price: u64,
    pub expiration_ms: i64,
    pub payment_address: String,
    pub dry_run: bool,
}

/// Outcome of a placement attempt. `WalletExhausted` is a normal
/// branch (remote 429), not an error: the caller disables the wallet
/// for its window and short-circuits the cycle.
#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    Placed(PlacedOffer),
    WalletExhausted,
}

#[derive(Debug, Clone)]
pub struct ItemOfferRequest {
    pub token_id: String,
    pub collection_symbol: String,
    pub price: u64,
    pub expiration_ms: i64,
    pub wallet: WalletHandle,
    /// Where a won item is delivered (wallet's own or centralized).
    pub receive_address: String,
    pub fee_sats_per_vbyte: u64,
}

#[derive(Debug, Clone)]
pub struct CollectionOfferRequest {
    pub collection_symbol: String,
    pub price: u64,
    pub expiration_ms: i64,
    pub wallet: WalletHandle,
    pub receive_address: String,
    pub fee_sats_per_vbyte: u64,
    /// Our standing collection offer, cancelled before a conflicting
    /// resubmission (one collection offer allowed per collection).
    pub existing_offer_id: Option<String>,
}

/// External signing seam. Key material never leaves the WIF handle;
/// implementations derive the public key and sign marketplace templates.
pub trait OfferSigner: Send + Sync {
    fn payment_public_key(&self, wif: &str) -> Result<String>;
    fn sign_template(&self, template: &str, input_indices: &[u32], wif: &str) -> Result<String>;
}

#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Marketplace-reported floor price in sats.
    async fn floor_price(&self, collection_symbol: &str) -> Result<u64>;

    /// Cheapest `limit` listings, price ascending.
    async fn cheapest_listings(&self, collection_symbol: &str, limit: usize)
        -> Result<Vec<Listing>>;

    /// Current best valid offer on a token, if any.
    async fn best_token_offer(&self, token_id: &str) -> Result<Option<TokenOffer>>;

    /// Current best collection-wide offer, if any.
    async fn best_collection_offer(
        &self,
        collection_symbol: &str,
    ) -> Result<Option<CollectionOfferView>>;

    async fn place_item_offer(&self, request: &ItemOfferRequest) -> Result<PlaceOutcome>;

    async fn place_collection_offer(
        &self,
        request: &CollectionOfferRequest,
    ) -> Result<PlaceOutcome>;

    /// Cancel a standing offer. `wif` is the signing handle of the
    /// wallet that placed it.
    async fn cancel_offer(&self, offer_id: &str, wif: &str) -> Result<()>;
}

/// Client-side sliding window shared by every marketplace request.
///
/// The marketplace rate-limits per key, not per endpoint, so one
/// limiter fronts all of them.
pub struct RequestPacer {
    capacity: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RequestPacer {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            capacity: requests_per_second.max(1) as usize,
            window: Duration::from_secs(1),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request may go out, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock();
                let now = Instant::now();
                while let Some(front) = sent.front() {
                    if now.duration_since(*front) >= self.window {
                        sent.pop_front();
                    } else {
                        break;
                    }
                }
                if sent.len() < self.capacity {
                    sent.push_back(now);
                    return;
                }
                let oldest = sent.front().copied().unwrap_or(now);
                self.window.saturating_sub(now.duration_since(oldest))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct HttpMarketplace {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<RequestPacer>,
    signer: Option<Arc<dyn OfferSigner>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatResponse {
    #[serde(default)]
    floor_price: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokensResponse {
    #[serde(default)]
    tokens: Vec<TokenListing>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenListing {
    id: String,
    #[serde(default)]
    listed_price: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OffersResponse {
    #[serde(default)]
    offers: Vec<TokenOffer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionOffersResponse {
    #[serde(default)]
    offers: Vec<CollectionOfferView>,
}

/// Unsigned template returned by the offer-create endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferTemplate {
    psbt_base64: String,
    #[serde(default)]
    to_sign_inputs: Vec<u32>,
    #[serde(default)]
    offer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default)]
    offer_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpMarketplace {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        requests_per_second: u32,
        signer: Option<Arc<dyn OfferSigner>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = base_url.into();
        let api_key = api_key.into();
        if signer.is_none() {
            warn!("no offer signer configured; marketplace client is in DRY RUN mode");
        }
        Ok(Self {
            client,
            base_url,
            api_key,
            limiter: Arc::new(RequestPacer::new(requests_per_second)),
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// GET with transient-error retries. Connection-level failures are
    /// retried with a short backoff; HTTP error statuses are not.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut backoff = Duration::from_millis(500);
        for attempt in 1..=MAX_RETRIES {
            self.limiter.acquire().await;
            let sent = self
                .client
                .get(self.url(path))
                .header("X-NFT-API-Key", &self.api_key)
                .query(query)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) if attempt < MAX_RETRIES => {
                    debug!(path, attempt, error = %e, "transient request failure");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("GET {} failed", path)),
            };

            let status = response.status();
            if !status.is_success() {
                bail!("GET {} returned {}", path, status);
            }
            return response
                .json::<T>()
                .await
                .with_context(|| format!("GET {} returned invalid JSON", path));
        }
        unreachable!("retry loop always returns")
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(reqwest::StatusCode, Option<T>)> {
        self.limiter.acquire().await;
        let response = self
            .client
            .post(self.url(path))
            .header("X-NFT-API-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;

        let status = response.status();
        let parsed = response.json::<T>().await.ok();
        Ok((status, parsed))
    }

    /// Cancel whatever offer we already have on this token, clearing the
    /// way for the idempotency retry.
    async fn cancel_existing_item_offer(&self, token_id: &str, payment_address: &str, wif: &str) {
        let query = [
            ("status", "valid".to_string()),
            ("token_id", token_id.to_string()),
            ("wallet_address_buyer", payment_address.to_lowercase()),
            ("sortBy", "priceDesc".to_string()),
            ("limit", "1".to_string()),
        ];
        match self.get_json::<OffersResponse>("/offers/", &query).await {
            Ok(response) => {
                for offer in response.offers {
                    if let Some(id) = offer.id {
                        if let Err(e) = self.cancel_offer(&id, wif).await {
                            warn!(token_id, error = %e, "failed to cancel conflicting offer");
                        }
                    }
                }
            }
            Err(e) => warn!(token_id, error = %e, "failed to look up conflicting offer"),
        }
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn floor_price(&self, collection_symbol: &str) -> Result<u64> {
        let stat: StatResponse = self
            .get_json(
                "/stat",
                &[("collectionSymbol", collection_symbol.to_string())],
            )
            .await?;
        Ok(stat.floor_price)
    }

    async fn cheapest_listings(
        &self,
        collection_symbol: &str,
        limit: usize,
    ) -> Result<Vec<Listing>> {
        let response: TokensResponse = self
            .get_json(
                "/tokens",
                &[
                    ("collectionSymbol", collection_symbol.to_string()),
                    ("sortBy", "priceAsc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(response
            .tokens
            .into_iter()
            .map(|t| Listing {
                id: t.id,
                price: t.listed_price,
            })
            .collect())
    }

    async fn best_token_offer(&self, token_id: &str) -> Result<Option<TokenOffer>> {
        let response: OffersResponse = self
            .get_json(
                "/offers/",
                &[
                    ("status", "valid".to_string()),
                    ("token_id", token_id.to_string()),
                    ("sortBy", "priceDesc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(response.offers.into_iter().next())
    }

    async fn best_collection_offer(
        &self,
        collection_symbol: &str,
    ) -> Result<Option<CollectionOfferView>> {
        let response: CollectionOffersResponse = self
            .get_json(
                "/collection-offers/",
                &[
                    ("collectionSymbol", collection_symbol.to_string()),
                    ("sortBy", "priceDesc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(response.offers.into_iter().next())
    }

    async fn place_item_offer(&self, request: &ItemOfferRequest) -> Result<PlaceOutcome> {
        let Some(signer) = self.signer.as_ref() else {
            warn!(
                token_id = %request.token_id,
                price = request.price,
                wallet = %request.wallet.label,
                "DRY RUN: would place item offer"
            );
            return Ok(PlaceOutcome::Placed(PlacedOffer {
                offer_id: None,
                price: request.price,
                expiration_ms: request.expiration_ms,
                payment_address: request.wallet.payment_address.clone(),
                dry_run: true,
            }));
        };

        let public_key = signer.payment_public_key(&request.wallet.wif)?;
        let query = [
            ("tokenId", request.token_id.clone()),
            ("price", request.price.to_string()),
            ("expirationDate", request.expiration_ms.to_string()),
            ("buyerTokenReceiveAddress", request.receive_address.clone()),
            (
                "buyerPaymentAddress",
                request.wallet.payment_address.clone(),
            ),
            ("buyerPaymentPublicKey", public_key),
            ("feerateTier", request.fee_sats_per_vbyte.to_string()),
        ];

        for attempt in 1..=MAX_RETRIES {
            self.limiter.acquire().await;
            let response = self
                .client
                .get(self.url("/offers/create"))
                .header("X-NFT-API-Key", &self.api_key)
                .query(&query)
                .send()
                .await
                .context("GET /offers/create failed")?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Ok(PlaceOutcome::WalletExhausted);
            }
            if !response.status().is_success() {
                bail!("GET /offers/create returned {}", response.status());
            }

            let template: OfferTemplate = response
                .json()
                .await
                .context("GET /offers/create returned invalid JSON")?;
            let signed =
                signer.sign_template(&template.psbt_base64, &template.to_sign_inputs, &request.wallet.wif)?;

            let body = serde_json::json!({
                "signedPSBTBase64": signed,
                "tokenId": request.token_id,
                "price": request.price,
                "expirationDate": request.expiration_ms.to_string(),
                "buyerPaymentAddress": request.wallet.payment_address,
                "buyerTokenReceiveAddress": request.receive_address,
            });
            let (status, submit) = self
                .post_json::<SubmitResponse>("/offers/create", &body)
                .await?;

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Ok(PlaceOutcome::WalletExhausted);
            }
            if status.is_success() {
                let offer_id = submit.and_then(|s| s.offer_id).or(template.offer_id);
                debug!(token_id = %request.token_id, price = request.price, "item offer placed");
                return Ok(PlaceOutcome::Placed(PlacedOffer {
                    offer_id,
                    price: request.price,
                    expiration_ms: request.expiration_ms,
                    payment_address: request.wallet.payment_address.clone(),
                    dry_run: false,
                }));
            }

            let message = submit.and_then(|s| s.error).unwrap_or_default();
            if message.contains(ALREADY_HAVE_ITEM_OFFER) && attempt < MAX_RETRIES {
                info!(
                    token_id = %request.token_id,
                    attempt,
                    "offer already exists; cancelling and retrying"
                );
                self.cancel_existing_item_offer(
                    &request.token_id,
                    &request.wallet.payment_address,
                    &request.wallet.wif,
                )
                .await;
                tokio::time::sleep(RETRY_SPACING).await;
                continue;
            }
            bail!(
                "POST /offers/create returned {} ({})",
                status,
                if message.is_empty() { "no error body" } else { message.as_str() }
            );
        }

        Err(anyhow!(
            "item offer for {} not accepted after {} attempts",
            request.token_id,
            MAX_RETRIES
        ))
    }

    async fn place_collection_offer(
        &self,
        request: &CollectionOfferRequest,
    ) -> Result<PlaceOutcome> {
        let Some(signer) = self.signer.as_ref() else {
            warn!(
                collection = %request.collection_symbol,
                price = request.price,
                wallet = %request.wallet.label,
                "DRY RUN: would place collection offer"
            );
            return Ok(PlaceOutcome::Placed(PlacedOffer {
                offer_id: None,
                price: request.price,
                expiration_ms: request.expiration_ms,
                payment_address: request.wallet.payment_address.clone(),
                dry_run: true,
            }));
        };

        let public_key = signer.payment_public_key(&request.wallet.wif)?;
        let query = [
            ("collectionSymbol", request.collection_symbol.clone()),
            ("price", request.price.to_string()),
            ("expirationDate", request.expiration_ms.to_string()),
            ("buyerTokenReceiveAddress", request.receive_address.clone()),
            (
                "buyerPaymentAddress",
                request.wallet.payment_address.clone(),
            ),
            ("buyerPaymentPublicKey", public_key),
            ("feerateTier", request.fee_sats_per_vbyte.to_string()),
        ];

        for attempt in 1..=MAX_RETRIES {
            self.limiter.acquire().await;
            let response = self
                .client
                .get(self.url("/collection-offers/psbt/create"))
                .header("X-NFT-API-Key", &self.api_key)
                .query(&query)
                .send()
                .await
                .context("GET /collection-offers/psbt/create failed")?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Ok(PlaceOutcome::WalletExhausted);
            }
            if !response.status().is_success() {
                bail!(
                    "GET /collection-offers/psbt/create returned {}",
                    response.status()
                );
            }

            let template: OfferTemplate = response
                .json()
                .await
                .context("GET /collection-offers/psbt/create returned invalid JSON")?;
            let signed =
                signer.sign_template(&template.psbt_base64, &template.to_sign_inputs, &request.wallet.wif)?;

            let body = serde_json::json!({
                "signedPSBTBase64": signed,
                "collectionSymbol": request.collection_symbol,
                "price": request.price,
                "expirationDate": request.expiration_ms.to_string(),
                "buyerPaymentAddress": request.wallet.payment_address,
                "buyerTokenReceiveAddress": request.receive_address,
            });
            let (status, submit) = self
                .post_json::<SubmitResponse>("/collection-offers/psbt/create", &body)
                .await?;

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Ok(PlaceOutcome::WalletExhausted);
            }
            if status.is_success() {
                let offer_id = submit.and_then(|s| s.offer_id).or(template.offer_id);
                debug!(
                    collection = %request.collection_symbol,
                    price = request.price,
                    "collection offer placed"
                );
                return Ok(PlaceOutcome::Placed(PlacedOffer {
                    offer_id,
                    price: request.price,
                    expiration_ms: request.expiration_ms,
                    payment_address: request.wallet.payment_address.clone(),
                    dry_run: false,
                }));
            }

            let message = submit.and_then(|s| s.error).unwrap_or_default();
            if message.contains(ONLY_ONE_COLLECTION_OFFER) && attempt < MAX_RETRIES {
                info!(
                    collection = %request.collection_symbol,
                    attempt,
                    "collection offer already exists; cancelling and retrying"
                );
                if let Some(existing) = request.existing_offer_id.as_deref() {
                    if let Err(e) = self.cancel_offer(existing, &request.wallet.wif).await {
                        warn!(
                            collection = %request.collection_symbol,
                            error = %e,
                            "failed to cancel standing collection offer"
                        );
                    }
                }
                tokio::time::sleep(RETRY_SPACING).await;
                continue;
            }
            bail!(
                "POST /collection-offers/psbt/create returned {} ({})",
                status,
                if message.is_empty() { "no error body" } else { message.as_str() }
            );
        }

        Err(anyhow!(
            "collection offer for {} not accepted after {} attempts",
            request.collection_symbol,
            MAX_RETRIES
        ))
    }

    async fn cancel_offer(&self, offer_id: &str, wif: &str) -> Result<()> {
        let Some(signer) = self.signer.as_ref() else {
            warn!(offer_id, "DRY RUN: would cancel offer");
            return Ok(());
        };

        let template: OfferTemplate = self
            .get_json("/offers/cancel", &[("offerId", offer_id.to_string())])
            .await?;

        // The cancel template must be signed by the wallet that placed
        // the original offer.
        let signed = signer.sign_template(&template.psbt_base64, &template.to_sign_inputs, wif)?;
        let body = serde_json::json!({
            "offerId": offer_id,
            "signedPSBTBase64": signed,
        });
        let (status, _response) = self.post_json::<SubmitResponse>("/offers/cancel", &body).await?;
        if !status.is_success() {
            bail!("POST /offers/cancel returned {}", status);
        }
        debug!(offer_id, "offer cancelled");
        Ok(())
    }
}
