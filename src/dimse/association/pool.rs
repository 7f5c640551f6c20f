//! Generic object pool, used to bound concurrent outbound associations at `maxAssociations`
//! and to recycle associations (via C-ECHO) instead of reconnecting for every operation.
//!
//! Opening and closing a fresh association per SCU operation would also be correct; pooling
//! here is what enforces the `maxAssociations` cap uniformly across C-FIND/C-MOVE/C-GET.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use super::client::{ClientAssociation, ClientAssociationOptions};
use super::AssociationError;
use crate::dimse::cecho::EchoServiceClassUser;
use crate::types::Uid;

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("timed out waiting for a pooled association")]
	Timeout,
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter) -> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("semaphore is never closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));
				if target.is_some() {
					target
				} else {
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(slot) = slot {
				if self.inner.manager.recycle(&slot.object).await.is_ok() {
					slot
				} else {
					self.create_slot(parameter).await?
				}
			} else {
				self.create_slot(parameter).await?
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}

	async fn create_slot(
		&self,
		parameter: M::Parameter,
	) -> Result<ObjectInner<M>, PoolError<M::Error>> {
		let object = self.inner.manager.create(&parameter).await?;
		let now = Instant::now();
		Ok(ObjectInner {
			object,
			parameter,
			metrics: Metrics {
				recycle_count: 0,
				created: now,
				last_used: now,
			},
		})
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(object) = self.inner.take() {
				pool.slots.lock().unwrap().push_back(object);
			}
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	#[allow(dead_code)]
	metrics: Metrics,
}

#[derive(Debug)]
struct Metrics {
	created: Instant,
	recycle_count: usize,
	last_used: Instant,
}

pub struct AssociationManager {
	pub address: SocketAddr,
	pub calling_aet: String,
	pub called_aet: String,
}

#[derive(Clone)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: Uid,
	pub transfer_syntax_uids: Vec<Uid>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

impl Manager for AssociationManager {
	type Object = ClientAssociation;
	type Error = AssociationError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = ClientAssociationOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address: self.address,
		};

		let association = ClientAssociation::new(options).await.map_err(PoolError::Backend);
		match &association {
			Ok(association) => info!(
				association_id = association.uuid().to_string(),
				"created new client association"
			),
			Err(_) => warn!("failed to create new client association"),
		}
		association
	}

	async fn recycle(&self, association: &Self::Object) -> Result<(), String> {
		let successful = EchoServiceClassUser::new(association)
			.echo(Duration::from_secs(5))
			.await
			.map_err(|err| format!("failed to recycle association: {err}"))?;

		if successful {
			Ok(())
		} else {
			Err(String::from("C-ECHO returned a non-successful status during recycle"))
		}
	}
}

pub type AssociationPool = Pool<AssociationManager>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn presentation_parameter_matches_overlapping_transfer_syntaxes() {
		let a = PresentationParameter {
			abstract_syntax_uid: "1.2.840.10008.1.1".into(),
			transfer_syntax_uids: vec!["1.2.840.10008.1.2".into(), "1.2.840.10008.1.2.1".into()],
		};
		let b = PresentationParameter {
			abstract_syntax_uid: "1.2.840.10008.1.1".into(),
			transfer_syntax_uids: vec!["1.2.840.10008.1.2.1".into()],
		};
		assert_eq!(a, b);

		let c = PresentationParameter {
			abstract_syntax_uid: "1.2.840.10008.1.1".into(),
			transfer_syntax_uids: vec!["1.2.840.10008.1.2.2".into()],
		};
		assert_ne!(a, c);
	}
}
