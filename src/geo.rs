//! Caller location and nearest server selection over streamed markup attributes.

use std::fmt::Display;

use log::debug;

use crate::feed::AttributeSink;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

const IP_CAPACITY: usize = 512;
const ISP_CAPACITY: usize = 128;
const URL_CAPACITY: usize = 512;
const NAME_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// Great circle distance in kilometers.
pub fn haversine(from: Coordinates, to: Coordinates) -> f64 {
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.latitude.to_radians().cos()
            * to.latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Reads the longest leading decimal number in `text`, yielding 0.0 when there is none.
pub fn parse_degrees(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let integral = digits(end);
    end += integral;
    let mut fraction = 0;
    if bytes.get(end) == Some(&b'.') {
        fraction = digits(end + 1);
        if integral + fraction > 0 {
            end += 1 + fraction;
        }
    }
    if integral + fraction == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exponent = digits(end + 1 + sign);
        if exponent > 0 {
            end += 1 + sign + exponent;
        }
    }
    text[..end].parse().unwrap_or(0.0)
}

fn bounded(value: &str, capacity: usize) -> String {
    if value.len() <= capacity {
        return value.to_string();
    }
    let mut end = capacity;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Who the measurement servers see: address, location and provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub latitude: f64,
    pub longitude: f64,
    pub isp: String,
}

impl ClientInfo {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

impl AttributeSink for ClientInfo {
    fn attribute(&mut self, name: &str, value: &str) {
        match name {
            "ip" => self.ip = bounded(value, IP_CAPACITY),
            "lat" => self.latitude = parse_degrees(value),
            "lon" => self.longitude = parse_degrees(value),
            "isp" => self.isp = bounded(value, ISP_CAPACITY),
            _ => {}
        }
    }
}

impl Display for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Your IP         : {}", self.ip)?;
        writeln!(f, "Your location   : {}", self.coordinates())?;
        write!(f, "Your ISP        : {}", self.isp)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerRecord {
    pub url: String,
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Kilometers from the caller
    pub distance: f64,
}

impl ServerRecord {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

impl Display for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Nearest server  : {} ({}, {})", self.url, self.name, self.country)?;
        write!(
            f,
            "Server location : {} at {:.1} km",
            self.coordinates(),
            self.distance
        )
    }
}

#[derive(Debug, Default)]
struct Pending {
    record: ServerRecord,
    has_url: bool,
    has_latitude: bool,
    /// `lon` was seen, the record was evaluated or dropped
    closed: bool,
}

/// Keeps the closest server record seen so far, in a single pass over the server list.
///
/// Attributes of a record accumulate until its `lon`, which completes the record; a record
/// still lacking `url` or `lat` at that point is dropped. Each `server` element starts a new
/// record. Ties keep the record seen first.
#[derive(Debug, Default)]
pub struct NearestServer {
    client: Coordinates,
    pending: Pending,
    best: Option<ServerRecord>,
    /// The pending record is the current best, so late `name`/`country` attributes apply to both
    best_is_pending: bool,
    evaluated: usize,
}

impl NearestServer {
    pub fn new(client: Coordinates) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    pub fn best(&self) -> Option<&ServerRecord> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<ServerRecord> {
        self.best
    }

    /// Complete records compared so far.
    pub fn evaluated(&self) -> usize {
        self.evaluated
    }

    fn reset_pending(&mut self) {
        self.pending = Pending::default();
        self.best_is_pending = false;
    }

    fn complete(&mut self) {
        let pending = &mut self.pending;
        pending.closed = true;
        if !(pending.has_url && pending.has_latitude) {
            debug!("dropping incomplete server record {:?}", pending.record.url);
            return;
        }

        pending.record.distance = haversine(self.client, pending.record.coordinates());
        self.evaluated += 1;
        let closer = self
            .best
            .as_ref()
            .is_none_or(|best| pending.record.distance < best.distance);
        if closer {
            debug!(
                "closest server so far: {} at {:.1} km",
                pending.record.url, pending.record.distance
            );
            self.best = Some(pending.record.clone());
        }
        self.best_is_pending = closer;
    }

    fn describe(&mut self, update: impl Fn(&mut ServerRecord)) {
        update(&mut self.pending.record);
        if self.best_is_pending {
            if let Some(best) = self.best.as_mut() {
                update(best);
            }
        }
    }
}

impl AttributeSink for NearestServer {
    fn element_start(&mut self, name: &str) {
        if name == "server" {
            self.reset_pending();
        }
    }

    fn attribute(&mut self, name: &str, value: &str) {
        match name {
            "url" => {
                if self.pending.closed {
                    self.reset_pending();
                }
                self.pending.record.url = bounded(value, URL_CAPACITY);
                self.pending.has_url = true;
            }
            "lat" => {
                self.pending.record.latitude = parse_degrees(value);
                self.pending.has_latitude = true;
            }
            "lon" => {
                self.pending.record.longitude = parse_degrees(value);
                self.complete();
            }
            "name" => {
                let name = bounded(value, NAME_CAPACITY);
                self.describe(|record| record.name = name.clone());
            }
            "country" => {
                let country = bounded(value, NAME_CAPACITY);
                self.describe(|record| record.country = country.clone());
            }
            _ => {}
        }
    }
}
