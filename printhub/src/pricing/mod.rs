//! Print price estimation.
//!
//! The estimate turns model volume into printed weight and machine time, then into cost:
//!
//! ```text
//! effective_volume = volume × (shell + (1 − shell) × infill/100) × (1 + support_overhead)
//! weight_g         = effective_volume × density
//! print_hours      = weight_g / throughput + setup_hours
//! unit_cost        = weight_g × price_per_gram + print_hours × hourly_rate
//! subtotal         = max(unit_cost × quantity + base_fee, minimum_order_price)
//! ```
//!
//! Intermediate values keep full `Decimal` precision; only the reported figures are rounded.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use sqlx::PgConnection;
use thiserror::Error;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use crate::{
    db::{
        handlers::{Printers, Repository},
        models::{
            materials::{MaterialDBResponse, MaterialKind},
            printers::PrinterDBResponse,
            settings::PricingSettings,
        },
    },
    errors::Error,
    types::{PrinterId, abbrev_uuid},
};

pub mod stl;

/// Largest model volume we will quote, one cubic metre
const MAX_VOLUME_CM3: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("Model volume must be positive")]
    NonPositiveVolume,

    #[error("Model volume exceeds 1000000 cm³")]
    VolumeTooLarge,

    #[error("Infill must be between 0 and 100 percent")]
    InfillOutOfRange,

    #[error("Quantity must be between 1 and {max}")]
    QuantityOutOfRange { max: i32 },

    #[error("Material density must be positive")]
    InvalidDensity,

    #[error("Printer throughput must be positive")]
    InvalidThroughput,

    #[error("Material '{0}' is not available")]
    MaterialUnavailable(String),
}

impl From<PricingError> for Error {
    fn from(err: PricingError) -> Self {
        Error::BadRequest { message: err.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct EstimateInput {
    pub volume_cm3: Decimal,
    pub infill_percent: i16,
    pub quantity: i32,
}

/// Machine cost parameters: a chosen printer, or the shop-wide fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRates {
    pub printer_id: Option<PrinterId>,
    pub hourly_rate: Decimal,
    pub throughput_g_per_hour: Decimal,
}

impl MachineRates {
    pub fn fallback(pricing: &PricingSettings) -> Self {
        Self {
            printer_id: None,
            hourly_rate: pricing.fallback_hourly_rate,
            throughput_g_per_hour: pricing.fallback_throughput_g_per_hour,
        }
    }
}

impl From<&PrinterDBResponse> for MachineRates {
    fn from(printer: &PrinterDBResponse) -> Self {
        Self {
            printer_id: Some(printer.id),
            hourly_rate: printer.hourly_rate,
            throughput_g_per_hour: printer.throughput_g_per_hour,
        }
    }
}

/// Price breakdown for one order line (all copies of one model set).
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PriceEstimate {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub printer_id: Option<PrinterId>,
    pub volume_cm3: Decimal,
    /// Volume actually extruded per copy, after infill and supports
    pub effective_volume_cm3: Decimal,
    /// Per copy
    pub weight_g: Decimal,
    /// Per copy, including setup
    pub print_hours: Decimal,
    pub material_cost: Decimal,
    pub machine_cost: Decimal,
    pub unit_cost: Decimal,
    pub quantity: i32,
    pub base_fee: Decimal,
    pub subtotal: Decimal,
    /// The minimum order price replaced the computed subtotal
    pub minimum_applied: bool,
}

/// Round to whole grosze, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn estimate(
    input: &EstimateInput,
    material: &MaterialDBResponse,
    machine: &MachineRates,
    pricing: &PricingSettings,
) -> Result<PriceEstimate, PricingError> {
    if input.volume_cm3 <= Decimal::ZERO {
        return Err(PricingError::NonPositiveVolume);
    }
    if input.volume_cm3 > MAX_VOLUME_CM3 {
        return Err(PricingError::VolumeTooLarge);
    }
    if !(0..=100).contains(&input.infill_percent) {
        return Err(PricingError::InfillOutOfRange);
    }
    if input.quantity < 1 || input.quantity > pricing.max_quantity {
        return Err(PricingError::QuantityOutOfRange {
            max: pricing.max_quantity,
        });
    }
    if !material.available {
        return Err(PricingError::MaterialUnavailable(material.name.clone()));
    }
    if material.density_g_cm3 <= Decimal::ZERO {
        return Err(PricingError::InvalidDensity);
    }
    if machine.throughput_g_per_hour <= Decimal::ZERO {
        return Err(PricingError::InvalidThroughput);
    }

    let infill = Decimal::from(input.infill_percent) / Decimal::ONE_HUNDRED;
    let fill_factor = pricing.shell_fraction + (Decimal::ONE - pricing.shell_fraction) * infill;
    let effective_volume = input.volume_cm3 * fill_factor * (Decimal::ONE + pricing.support_overhead);

    let weight_g = effective_volume * material.density_g_cm3;
    let print_hours = weight_g / machine.throughput_g_per_hour + pricing.setup_hours;

    let material_cost = weight_g * material.price_per_gram;
    let machine_cost = print_hours * machine.hourly_rate;
    let unit_cost = material_cost + machine_cost;

    let computed = unit_cost * Decimal::from(input.quantity) + pricing.base_fee;
    let minimum_applied = computed < pricing.minimum_order_price;
    let subtotal = if minimum_applied {
        pricing.minimum_order_price
    } else {
        computed
    };

    Ok(PriceEstimate {
        printer_id: machine.printer_id,
        volume_cm3: input.volume_cm3,
        effective_volume_cm3: effective_volume.round_dp(3),
        weight_g: weight_g.round_dp(2),
        print_hours: print_hours.round_dp(2),
        material_cost: round_money(material_cost),
        machine_cost: round_money(machine_cost),
        unit_cost: round_money(unit_cost),
        quantity: input.quantity,
        base_fee: pricing.base_fee,
        subtotal: round_money(subtotal),
        minimum_applied,
    })
}

/// Cheapest printer that is taking jobs, runs the material and fits the part.
/// Falls back to the shop-wide rates when none qualifies.
pub fn select_machine(
    printers: &[PrinterDBResponse],
    kind: MaterialKind,
    bbox_mm: Option<[Decimal; 3]>,
    pricing: &PricingSettings,
) -> MachineRates {
    printers
        .iter()
        .filter(|p| p.status.accepts_jobs() && p.supports(kind))
        .filter(|p| bbox_mm.is_none_or(|bbox| p.fits(bbox)))
        .min_by_key(|p| p.hourly_rate)
        .map(MachineRates::from)
        .unwrap_or_else(|| MachineRates::fallback(pricing))
}

/// Resolve the machine rates for a quote. An explicitly requested printer must be able to take
/// the job; otherwise the cheapest suitable printer is picked.
#[instrument(skip(conn, material, pricing), fields(material = %material.name), err)]
pub async fn machine_for(
    conn: &mut PgConnection,
    material: &MaterialDBResponse,
    printer_id: Option<PrinterId>,
    bbox_mm: Option<[Decimal; 3]>,
    pricing: &PricingSettings,
) -> Result<MachineRates, Error> {
    let mut repo = Printers::new(conn);

    let Some(printer_id) = printer_id else {
        let printers = repo.list_for_kind(material.kind).await?;
        let machine = select_machine(&printers, material.kind, bbox_mm, pricing);
        debug!(printer_id = ?machine.printer_id, "Selected machine for quote");
        return Ok(machine);
    };

    let printer = repo.get_by_id(printer_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Printer".to_string(),
        id: printer_id.to_string(),
    })?;

    if !printer.status.accepts_jobs() {
        return Err(Error::BadRequest {
            message: format!("Printer {} is not accepting jobs", printer.name),
        });
    }
    if !printer.supports(material.kind) {
        return Err(Error::BadRequest {
            message: format!("Printer {} cannot print {}", printer.name, material.kind),
        });
    }
    if bbox_mm.is_some_and(|bbox| !printer.fits(bbox)) {
        return Err(Error::BadRequest {
            message: format!("Model does not fit the build volume of printer {}", printer.name),
        });
    }

    debug!(printer_id = %abbrev_uuid(&printer.id), "Using requested printer");
    Ok(MachineRates::from(&printer))
}
