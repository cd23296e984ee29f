//! Sizing client: the memoised, per-`sizingName` wrapper around a user's
//! pure `sizeFor(equity, price, params) -> quantity` function.
//!
//! Stateless by construction (§2 row 6: "pure function"), so unlike
//! [`crate::risk::ClientRisk`] there is nothing to load or persist; the
//! client exists purely so the connection registry can own one instance per
//! name for process lifetime, per §3's ownership invariant.

use std::sync::Arc;

use engine_types::schema::SizingSchema;
use rust_decimal::Decimal;

/// One instance per `sizingName`, shared across every strategy whose schema
/// points to it.
pub struct ClientSizing {
    pub sizing_name: String,
    schema: SizingSchema,
}

impl ClientSizing {
    pub fn new(schema: SizingSchema) -> Self {
        Self {
            sizing_name: schema.sizing_name.clone(),
            schema,
        }
    }

    pub fn size_for(&self, equity: Decimal, price: Decimal, params: &serde_json::Value) -> Decimal {
        self.schema.sizer.size_for(equity, price, params)
    }
}

/// Either a shared sizing client or the no-op used by strategies without a
/// `sizingName`.
pub enum SizingHandle {
    Shared(Arc<ClientSizing>),
    None,
}

impl SizingHandle {
    pub fn size_for(&self, equity: Decimal, price: Decimal, params: &serde_json::Value) -> Option<Decimal> {
        match self {
            SizingHandle::Shared(sizing) => Some(sizing.size_for(equity, price, params)),
            SizingHandle::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_types::schema::SizingLogic;
    use rust_decimal_macros::dec;

    struct FixedFractionSizer {
        fraction: Decimal,
    }

    impl SizingLogic for FixedFractionSizer {
        fn size_for(&self, equity: Decimal, price: Decimal, _params: &serde_json::Value) -> Decimal {
            (equity * self.fraction) / price
        }
    }

    #[test]
    fn client_sizing_delegates_to_the_registered_logic() {
        let schema = SizingSchema::new("half_equity", Arc::new(FixedFractionSizer { fraction: dec!(0.5) }));
        let client = ClientSizing::new(schema);

        let quantity = client.size_for(dec!(10000), dec!(100), &serde_json::Value::Null);
        assert_eq!(quantity, dec!(50));
    }

    #[test]
    fn sizing_handle_none_yields_no_quantity() {
        let handle = SizingHandle::None;
        assert_eq!(handle.size_for(dec!(10000), dec!(100), &serde_json::Value::Null), None);
    }

    #[test]
    fn sizing_handle_shared_delegates() {
        let schema = SizingSchema::new("half_equity", Arc::new(FixedFractionSizer { fraction: dec!(0.5) }));
        let handle = SizingHandle::Shared(Arc::new(ClientSizing::new(schema)));
        assert_eq!(
            handle.size_for(dec!(10000), dec!(100), &serde_json::Value::Null),
            Some(dec!(50))
        );
    }
}
