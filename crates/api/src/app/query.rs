//! Read-side services: the order store, its read gateway and the applier
//! feeding it.

use std::io;
use std::sync::Arc;

use orderflow_core::AggregateId;
use orderflow_events::EventSource;
use orderflow_infra::projections::{MaterializedView, OrderView, OrdersProjection};
use orderflow_infra::{
    Applier, ApplierConfig, ApplierHandle, HealthState, InMemoryProjectionStore, ReadGateway,
};
use orderflow_orders::registry;

pub type OrderStore = Arc<InMemoryProjectionStore<AggregateId, OrderView>>;
pub type OrdersGateway = ReadGateway<OrderStore, OrderView>;

#[derive(Debug, Clone)]
pub struct QueryServices {
    gateway: OrdersGateway,
    health: Arc<HealthState>,
}

impl QueryServices {
    pub fn new(gateway: OrdersGateway, health: Arc<HealthState>) -> Self {
        Self { gateway, health }
    }

    /// Create an empty store and start an applier that feeds it from `source`.
    ///
    /// The read model is rebuilt from the log on every start.
    pub fn start<Src>(source: Src, config: ApplierConfig) -> io::Result<(Self, ApplierHandle)>
    where
        Src: EventSource + 'static,
    {
        let store: OrderStore = Arc::new(InMemoryProjectionStore::new());
        let view = Arc::new(MaterializedView::new(OrdersProjection, store.clone()));
        let handle = Applier::new(source, view, registry(), config).spawn("order-applier")?;

        Ok((Self::new(ReadGateway::new(store), handle.health()), handle))
    }

    pub fn gateway(&self) -> &OrdersGateway {
        &self.gateway
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }
}
