//! Just enough of the MPD data model to build HLS playlists from it.
use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MpdError {
    #[error("malformed MPD: {0}")]
    Malformed(String),

    #[error("representation '{0}' not found")]
    RepresentationNotFound(String),

    #[error("unsupported MPD: {0}")]
    Unsupported(String),

    #[error("invalid url in MPD: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct Mpd {
    pub presentation_type: PresentationType,
    /// seconds
    pub media_presentation_duration: Option<f64>,
    pub base_url: Option<String>,
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone)]
pub struct Period {
    pub id: Option<String>,
    /// seconds
    pub duration: Option<f64>,
    pub base_url: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub codecs: Option<String>,
    pub lang: Option<String>,
    pub base_url: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub segment_list: Option<SegmentList>,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub base_url: Option<String>,
    pub segment_template: Option<SegmentTemplate>,
    pub segment_list: Option<SegmentList>,
}

/// every field is optional because templates inherit attribute by attribute from the levels above
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentTemplate {
    pub media: Option<String>,
    pub initialization: Option<String>,
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub start_number: Option<u64>,
    pub presentation_time_offset: Option<u64>,
    pub timeline: Option<Vec<TimelineEntry>>,
}

impl SegmentTemplate {
    /// fills whatever `self` leaves unset from `parent`
    pub fn inherit(&self, parent: &SegmentTemplate) -> SegmentTemplate {
        SegmentTemplate {
            media: self.media.clone().or_else(|| parent.media.clone()),
            initialization: self
                .initialization
                .clone()
                .or_else(|| parent.initialization.clone()),
            timescale: self.timescale.or(parent.timescale),
            duration: self.duration.or(parent.duration),
            start_number: self.start_number.or(parent.start_number),
            presentation_time_offset: self
                .presentation_time_offset
                .or(parent.presentation_time_offset),
            timeline: self.timeline.clone().or_else(|| parent.timeline.clone()),
        }
    }
}

/// one `<S>` element
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    /// -1 repeats until the next entry (or the end of the period)
    pub r: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentList {
    pub timescale: Option<u64>,
    pub duration: Option<u64>,
    pub initialization: Option<String>,
    pub segments: Vec<String>,
}

impl Mpd {
    pub fn parse(xml: &str) -> Result<Self, MpdError> {
        let root = parse_tree(xml)?;
        if root.name != "MPD" {
            return Err(MpdError::Malformed(format!(
                "root element is <{}>, expected <MPD>",
                root.name
            )));
        }

        let presentation_type = match root.attr("type") {
            Some("dynamic") => PresentationType::Dynamic,
            _ => PresentationType::Static,
        };

        let periods = root
            .children_named("Period")
            .map(Period::from_element)
            .collect::<Result<Vec<_>, _>>()?;

        if periods.is_empty() {
            return Err(MpdError::Malformed("MPD has no Period".to_string()));
        }

        Ok(Self {
            presentation_type,
            media_presentation_duration: root
                .attr("mediaPresentationDuration")
                .and_then(parse_iso_duration),
            base_url: root.base_url(),
            periods,
        })
    }

    pub fn is_static(&self) -> bool {
        self.presentation_type == PresentationType::Static
    }
}

impl Period {
    fn from_element(el: &XmlElement) -> Result<Self, MpdError> {
        Ok(Self {
            id: el.attr_owned("id"),
            duration: el.attr("duration").and_then(parse_iso_duration),
            base_url: el.base_url(),
            segment_template: el.child("SegmentTemplate").map(SegmentTemplate::from_element),
            adaptation_sets: el
                .children_named("AdaptationSet")
                .map(AdaptationSet::from_element)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

impl AdaptationSet {
    fn from_element(el: &XmlElement) -> Result<Self, MpdError> {
        Ok(Self {
            id: el.attr_owned("id"),
            content_type: el.attr_owned("contentType"),
            mime_type: el.attr_owned("mimeType"),
            codecs: el.attr_owned("codecs"),
            lang: el.attr_owned("lang"),
            base_url: el.base_url(),
            segment_template: el.child("SegmentTemplate").map(SegmentTemplate::from_element),
            segment_list: el.child("SegmentList").map(SegmentList::from_element),
            representations: el
                .children_named("Representation")
                .map(Representation::from_element)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

impl Representation {
    fn from_element(el: &XmlElement) -> Result<Self, MpdError> {
        let id = el
            .attr_owned("id")
            .ok_or_else(|| MpdError::Malformed("Representation without id".to_string()))?;

        Ok(Self {
            id,
            bandwidth: el.attr_parsed("bandwidth").unwrap_or(0),
            width: el.attr_parsed("width"),
            height: el.attr_parsed("height"),
            codecs: el.attr_owned("codecs"),
            mime_type: el.attr_owned("mimeType"),
            base_url: el.base_url(),
            segment_template: el.child("SegmentTemplate").map(SegmentTemplate::from_element),
            segment_list: el.child("SegmentList").map(SegmentList::from_element),
        })
    }
}

impl SegmentTemplate {
    fn from_element(el: &XmlElement) -> Self {
        let timeline = el.child("SegmentTimeline").map(|timeline| {
            timeline
                .children_named("S")
                .map(|s| TimelineEntry {
                    t: s.attr_parsed("t"),
                    d: s.attr_parsed("d").unwrap_or(0),
                    r: s.attr_parsed("r").unwrap_or(0),
                })
                .collect()
        });

        Self {
            media: el.attr_owned("media"),
            initialization: el.attr_owned("initialization"),
            timescale: el.attr_parsed("timescale"),
            duration: el.attr_parsed("duration"),
            start_number: el.attr_parsed("startNumber"),
            presentation_time_offset: el.attr_parsed("presentationTimeOffset"),
            timeline,
        }
    }
}

impl SegmentList {
    fn from_element(el: &XmlElement) -> Self {
        Self {
            timescale: el.attr_parsed("timescale"),
            duration: el.attr_parsed("duration"),
            initialization: el
                .child("Initialization")
                .and_then(|init| init.attr_owned("sourceURL")),
            segments: el
                .children_named("SegmentURL")
                .filter_map(|s| s.attr_owned("media"))
                .collect(),
        }
    }
}

/// `PT1H2M3.5S` style durations in seconds. years and months are approximated (365 / 30 days)
pub fn parse_iso_duration(raw: &str) -> Option<f64> {
    let rest = raw.trim().strip_prefix('P')?;
    let mut seconds = 0.0;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' | '.' | ',' => number.push(if c == ',' { '.' } else { c }),
            unit => {
                let value: f64 = number.parse().ok()?;
                number.clear();
                seconds += value
                    * match (unit, in_time) {
                        ('Y', false) => 365.0 * 86_400.0,
                        ('M', false) => 30.0 * 86_400.0,
                        ('W', false) => 7.0 * 86_400.0,
                        ('D', false) => 86_400.0,
                        ('H', true) => 3_600.0,
                        ('M', true) => 60.0,
                        ('S', true) => 1.0,
                        _ => return None,
                    };
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return None;
    }
    Some(seconds)
}

/// generic element tree, the typed model above is built from this
#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attributes: HashMap<String, String>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, MpdError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = HashMap::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| MpdError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| MpdError::Malformed(e.to_string()))?
                .into_owned();
            attributes.insert(key, value);
        }

        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn attr_owned(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    fn attr_parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    // only the first BaseURL counts, alternates are for cdn failover which we don't do
    fn base_url(&self) -> Option<String> {
        self.child("BaseURL")
            .map(|b| b.text.trim().to_string())
            .filter(|b| !b.is_empty())
    }
}

fn parse_tree(xml: &str) -> Result<XmlElement, MpdError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| MpdError::Malformed(e.to_string()))?;

        match event {
            Event::Start(start) => stack.push(XmlElement::from_start(&start)?),
            Event::Empty(start) => {
                let element = XmlElement::from_start(&start)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| MpdError::Malformed("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| MpdError::Malformed(e.to_string()))?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(MpdError::Malformed("unexpected end of document".to_string()));
    }

    root.ok_or_else(|| MpdError::Malformed("empty document".to_string()))
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}
