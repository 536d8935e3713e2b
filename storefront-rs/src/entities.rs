use chrono::{DateTime, Utc};
use tandem::Entity;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub item_id: String,
    pub qty: u32,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    /// Quantity per item id. Lines with quantity 0 are never stored.
    #[tsify(type = "Record<string, number>")]
    pub lines: im::OrdMap<String, u32>,
    /// When the server last sent the whole cart.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cart {
    pub fn from_lines(items: impl IntoIterator<Item = CartLine>, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            lines: items
                .into_iter()
                .filter(|line| line.qty > 0)
                .map(|line| (line.item_id, line.qty))
                .collect(),
            updated_at,
        }
    }

    pub fn qty(&self, item_id: &str) -> u32 {
        self.lines.get(item_id).copied().unwrap_or(0)
    }

    pub fn with_qty(mut self, item_id: &str, qty: u32) -> Self {
        if qty == 0 {
            self.lines.remove(item_id);
        } else {
            self.lines.insert(item_id.to_string(), qty);
        }
        self
    }

    pub fn item_count(&self) -> u32 {
        self.lines.values().sum()
    }
}

impl Entity for Cart {
    const KIND: &'static str = "cart";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub favorited: bool,
    /// How many users have favorited the product.
    pub count: u64,
}

impl Favorite {
    pub fn toggled(&self) -> Self {
        if self.favorited {
            Self {
                favorited: false,
                count: self.count.saturating_sub(1),
            }
        } else {
            Self {
                favorited: true,
                count: self.count + 1,
            }
        }
    }
}

impl Entity for Favorite {
    const KIND: &'static str = "favorite";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub amount_cents: i64,
    pub currency: String,
    /// Server time of this figure. Optimistic edits leave it alone.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Balance {
    const KIND: &'static str = "balance";
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, tsify::Tsify,
)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Order {
    const KIND: &'static str = "order";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_serializes_lines_as_a_map() {
        let cart = Cart::default().with_qty("a", 2).with_qty("b", 1);
        let json = serde_json::to_value(&cart).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"lines": {"a": 2, "b": 1}, "updatedAt": null})
        );
        assert_eq!(cart.item_count(), 3);
        assert_eq!(cart.with_qty("a", 0).qty("a"), 0);
    }

    #[test]
    fn toggling_a_favorite_moves_the_count() {
        let favorite = Favorite {
            favorited: false,
            count: 5,
        };
        let toggled = favorite.toggled();
        assert_eq!(
            toggled,
            Favorite {
                favorited: true,
                count: 6
            }
        );
        assert_eq!(toggled.toggled(), favorite);
    }
}
