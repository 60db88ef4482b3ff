//! Order entity with a guarded state machine.
//!
//! All mutation funnels through [`Order::try_transition`] / [`Order::update_fill`],
//! called under the engine mutex; an illegal transition is a rejected no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Placed,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderState::Pending | OrderState::Placed | OrderState::PartiallyFilled
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match self {
            Pending => matches!(next, Placed | Failed),
            Placed => matches!(next, PartiallyFilled | Filled | Cancelled),
            PartiallyFilled => matches!(next, PartiallyFilled | Filled | Cancelled),
            Filled | Cancelled | Failed => false,
        }
    }
}

/// A resting grid order as the engine tracks it.
///
/// Identity fields are immutable after construction; only state and fill
/// progress change. `grid_index` is positive for long-side rungs and
/// negative for short-side rungs. `related_order_id` links a counter-order
/// back to the opening order it flattens.
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub grid_index: i32,
    pub state: OrderState,
    pub filled_quantity: f64,
    pub filled_price: Option<f64>,
    pub related_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        price: f64,
        quantity: f64,
        grid_index: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            side,
            price,
            quantity,
            grid_index,
            state: OrderState::Pending,
            filled_quantity: 0.0,
            filled_price: None,
            related_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(mut self, state: OrderState) -> Self {
        self.state = state;
        self
    }

    pub fn with_related(mut self, related_order_id: impl Into<String>) -> Self {
        self.related_order_id = Some(related_order_id.into());
        self
    }

    pub fn remaining_quantity(&self) -> f64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Attempt a state transition. Returns false (and changes nothing) when
    /// the transition is not allowed by the state machine.
    pub fn try_transition(&mut self, next: OrderState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    /// Apply a fill observation, deriving the resulting state from the
    /// filled quantity. Returns the state after the update.
    pub fn update_fill(&mut self, filled_quantity: f64, filled_price: f64) -> OrderState {
        self.filled_quantity = filled_quantity;
        self.filled_price = Some(filled_price);
        self.updated_at = Utc::now();

        if filled_quantity >= self.quantity {
            self.try_transition(OrderState::Filled);
        } else if filled_quantity > 0.0 {
            self.try_transition(OrderState::PartiallyFilled);
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new("1", "BTC/USDT", Side::Buy, 100.0, 0.5, 1)
    }

    #[test]
    fn pending_goes_to_placed_or_failed() {
        let mut o = order();
        assert!(o.try_transition(OrderState::Placed));

        let mut o = order();
        assert!(o.try_transition(OrderState::Failed));

        let mut o = order();
        assert!(!o.try_transition(OrderState::Filled));
        assert_eq!(o.state, OrderState::Pending);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut o = order().with_state(OrderState::Filled);
        assert!(!o.try_transition(OrderState::Cancelled));
        assert!(!o.try_transition(OrderState::Placed));
        assert_eq!(o.state, OrderState::Filled);
    }

    #[test]
    fn partial_fill_can_repeat_then_fill() {
        let mut o = order().with_state(OrderState::Placed);
        assert_eq!(o.update_fill(0.2, 99.9), OrderState::PartiallyFilled);
        assert_eq!(o.update_fill(0.4, 99.9), OrderState::PartiallyFilled);
        assert_eq!(o.update_fill(0.5, 99.9), OrderState::Filled);
        assert_eq!(o.remaining_quantity(), 0.0);
    }

    #[test]
    fn cancelled_after_partial_is_allowed() {
        let mut o = order().with_state(OrderState::Placed);
        o.update_fill(0.1, 100.0);
        assert!(o.try_transition(OrderState::Cancelled));
    }

    #[test]
    fn placed_cannot_fail() {
        let mut o = order().with_state(OrderState::Placed);
        assert!(!o.try_transition(OrderState::Failed));
    }
}
