//! An in-memory keyed store and the five calls every resource exposes.
//!
//! | Method       | Pattern       | Request          | Response                |
//! | ------------ | ------------- | ---------------- | ----------------------- |
//! | `Create`     | unary         | resource         | created resource        |
//! | `Get`        | unary         | `{"id": ...}`    | resource                |
//! | `List`       | server stream | anything         | every resource, by id   |
//! | `BulkCreate` | client stream | resources        | `{"created": n}`        |
//! | `Sync`       | bidi stream   | resources        | each created resource   |
//!
//! `BulkCreate` and `Sync` stop at the first rejected resource. Resources
//! stored before the rejection stay stored.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::BTreeMap, sync::Arc};
use switchyard::{Error, Frame, FrameReceiver, FrameSender, Registry, Role, RoleGuard, Status};

pub const ADMIN: &str = "admin";
pub const VIEWER: &str = "viewer";

/// A record kept in a [`ResourceStore`].
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Fully qualified service name, e.g. `switchyard.Users`.
    const SERVICE: &'static str;
    /// Frame tag of encoded records.
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// # Errors
    ///
    /// `InvalidArgument` naming the offending field.
    fn validate(&self) -> Result<(), Status>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetRequest {
    pub id: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BulkCreated {
    pub created: u64,
}

#[derive(Debug)]
pub struct ResourceStore<T> {
    items: RwLock<BTreeMap<String, T>>,
}

impl<T> Default for ResourceStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Resource> ResourceStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `InvalidArgument` for an invalid record, `AlreadyExists` if the id is
    /// taken.
    pub fn create(&self, item: T) -> Result<T, Status> {
        item.validate()?;
        let mut items = self.items.write();
        if items.contains_key(item.id()) {
            return Err(Status::already_exists(format!(
                "{} `{}` already exists",
                T::KIND,
                item.id()
            )));
        }
        items.insert(item.id().to_string(), item.clone());
        Ok(item)
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn get(&self, id: &str) -> Result<T, Status> {
        self.items
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("{} `{id}` not found", T::KIND)))
    }

    /// Every record, ordered by id.
    pub fn list(&self) -> Vec<T> {
        self.items.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

pub fn method<T: Resource>(name: &str) -> String {
    format!("/{}/{name}", T::SERVICE)
}

/// Registers the five calls of `T` and returns `guard` extended with their
/// role requirements.
///
/// # Errors
///
/// [`Error::DuplicateRegistration`] if `T`'s service is already registered.
pub fn register<T: Resource>(
    registry: &mut Registry,
    guard: RoleGuard,
    store: Arc<ResourceStore<T>>,
) -> Result<RoleGuard, Error> {
    let s = Arc::clone(&store);
    registry.unary(&method::<T>("Create"), move |_ctx, frame| {
        create(Arc::clone(&s), frame)
    })?;
    let s = Arc::clone(&store);
    registry.unary(&method::<T>("Get"), move |_ctx, frame| get(Arc::clone(&s), frame))?;
    let s = Arc::clone(&store);
    registry.server_streaming(&method::<T>("List"), move |_ctx, _frame, out| {
        list(Arc::clone(&s), out)
    })?;
    let s = Arc::clone(&store);
    registry.client_streaming(&method::<T>("BulkCreate"), move |_ctx, inbound| {
        bulk_create(Arc::clone(&s), inbound)
    })?;
    registry.bidi_streaming(&method::<T>("Sync"), move |_ctx, inbound, out| {
        sync(Arc::clone(&store), inbound, out)
    })?;

    let writers = [Role::from(ADMIN)];
    let readers = [Role::from(ADMIN), Role::from(VIEWER)];
    Ok(guard
        .allow(method::<T>("Create"), writers.clone())
        .allow(method::<T>("BulkCreate"), writers.clone())
        .allow(method::<T>("Sync"), writers)
        .allow(method::<T>("Get"), readers.clone())
        .allow(method::<T>("List"), readers))
}

async fn create<T: Resource>(store: Arc<ResourceStore<T>>, frame: Frame) -> Result<Frame, Status> {
    let created = store.create(frame.decode_json()?)?;
    Frame::json(T::KIND, &created)
}

async fn get<T: Resource>(store: Arc<ResourceStore<T>>, frame: Frame) -> Result<Frame, Status> {
    let request: GetRequest = frame.decode_json()?;
    Frame::json(T::KIND, &store.get(&request.id)?)
}

async fn list<T: Resource>(
    store: Arc<ResourceStore<T>>,
    mut out: FrameSender,
) -> Result<(), Status> {
    // A cancelled call fails the next send, which ends the loop.
    for item in store.list() {
        out.send(Frame::json(T::KIND, &item)?)?;
    }
    Ok(())
}

async fn bulk_create<T: Resource>(
    store: Arc<ResourceStore<T>>,
    mut inbound: FrameReceiver,
) -> Result<Frame, Status> {
    let mut created = 0;
    while let Some(frame) = inbound.receive().await? {
        store.create(frame.decode_json()?)?;
        created += 1;
    }
    tracing::debug!(kind = T::KIND, created, "Bulk create finished");
    Frame::json("bulk_created", &BulkCreated { created })
}

async fn sync<T: Resource>(
    store: Arc<ResourceStore<T>>,
    mut inbound: FrameReceiver,
    mut out: FrameSender,
) -> Result<(), Status> {
    while let Some(frame) = inbound.receive().await? {
        let created = store.create(frame.decode_json()?)?;
        out.send(Frame::json(T::KIND, &created)?)?;
    }
    Ok(())
}
