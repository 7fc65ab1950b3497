// formstage/src/reaper/carts.rs

//! Guest cart expiry: the same lifecycle policy applied to shopping carts
//! without an owner.

use crate::reaper::{ReapReport, ReapTarget};
use crate::session::OwnerRef;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{event, instrument, Level};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCart {
  pub cart_id: Uuid,
  pub owner: Option<OwnerRef>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
  pub id: Uuid,
  pub cart_id: Uuid,
  pub product_id: String,
  pub quantity: u32,
  pub added_at: DateTime<Utc>,
}

#[async_trait]
pub trait CartStore: Send + Sync {
  /// Carts without an owner last updated before `cutoff`, oldest first.
  async fn expired_guest_carts(&self, cutoff: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<GuestCart>>;

  /// Deletes the cart's items; returns how many were deleted.
  async fn delete_cart_items(&self, cart: &GuestCart) -> anyhow::Result<usize>;

  async fn delete_cart(&self, cart: &GuestCart) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCartStore {
  carts: RwLock<HashMap<Uuid, GuestCart>>,
  items: RwLock<HashMap<Uuid, Vec<CartItem>>>,
  failing: Mutex<HashSet<Uuid>>,
}

impl InMemoryCartStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create_cart(&self, owner: Option<OwnerRef>, updated_at: DateTime<Utc>) -> Uuid {
    let cart_id = Uuid::new_v4();
    self.carts.write().insert(
      cart_id,
      GuestCart {
        cart_id,
        owner,
        updated_at,
      },
    );
    cart_id
  }

  pub fn add_item(&self, cart_id: Uuid, product_id: impl Into<String>, quantity: u32, at: DateTime<Utc>) {
    let item = CartItem {
      id: Uuid::new_v4(),
      cart_id,
      product_id: product_id.into(),
      quantity,
      added_at: at,
    };
    self.items.write().entry(cart_id).or_default().push(item);
    if let Some(cart) = self.carts.write().get_mut(&cart_id) {
      cart.updated_at = at;
    }
  }

  pub fn contains(&self, cart_id: Uuid) -> bool {
    self.carts.read().contains_key(&cart_id)
  }

  pub fn item_count(&self, cart_id: Uuid) -> usize {
    self.items.read().get(&cart_id).map_or(0, Vec::len)
  }

  pub fn len(&self) -> usize {
    self.carts.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.carts.read().is_empty()
  }

  /// Makes every delete touching `cart_id` fail.
  pub fn fail_deletes_of(&self, cart_id: Uuid) {
    self.failing.lock().insert(cart_id);
  }

  fn check(&self, cart_id: Uuid) -> anyhow::Result<()> {
    if self.failing.lock().contains(&cart_id) {
      anyhow::bail!("delete of cart {} disabled by fault injection", cart_id);
    }
    Ok(())
  }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
  async fn expired_guest_carts(&self, cutoff: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<GuestCart>> {
    let mut carts: Vec<GuestCart> = self
      .carts
      .read()
      .values()
      .filter(|c| c.owner.is_none() && c.updated_at < cutoff)
      .cloned()
      .collect();
    carts.sort_by_key(|c| c.updated_at);
    carts.truncate(limit);
    Ok(carts)
  }

  async fn delete_cart_items(&self, cart: &GuestCart) -> anyhow::Result<usize> {
    self.check(cart.cart_id)?;
    Ok(self.items.write().remove(&cart.cart_id).map_or(0, |items| items.len()))
  }

  async fn delete_cart(&self, cart: &GuestCart) -> anyhow::Result<()> {
    self.check(cart.cart_id)?;
    self.carts.write().remove(&cart.cart_id);
    Ok(())
  }
}

pub struct GuestCartReapTarget {
  store: Arc<dyn CartStore>,
  ttl: Duration,
  batch_size: usize,
}

impl GuestCartReapTarget {
  pub fn new(store: Arc<dyn CartStore>, ttl: Duration, batch_size: usize) -> Self {
    Self {
      store,
      ttl,
      batch_size: batch_size.max(1),
    }
  }
}

#[async_trait]
impl ReapTarget for GuestCartReapTarget {
  fn name(&self) -> &str {
    "guest_carts"
  }

  #[instrument(name = "GuestCartReapTarget::sweep", skip(self))]
  async fn sweep(&self, now: DateTime<Utc>) -> ReapReport {
    let mut report = ReapReport::default();
    let carts = match self.store.expired_guest_carts(now - self.ttl, self.batch_size).await {
      Ok(carts) => carts,
      Err(e) => {
        event!(Level::ERROR, error = %e, "Could not list expired guest carts.");
        report.failed += 1;
        return report;
      }
    };

    for cart in carts {
      let items = match self.store.delete_cart_items(&cart).await {
        Ok(n) => n,
        Err(e) => {
          event!(Level::WARN, cart_id = %cart.cart_id, error = %e, "Could not delete cart items.");
          report.failed += 1;
          continue;
        }
      };
      match self.store.delete_cart(&cart).await {
        Ok(()) => {
          event!(Level::INFO, cart_id = %cart.cart_id, items, "Guest cart reaped.");
          report.removed += 1;
        }
        Err(e) => {
          event!(Level::WARN, cart_id = %cart.cart_id, error = %e, "Could not delete cart.");
          report.failed += 1;
        }
      }
    }
    report
  }
}
