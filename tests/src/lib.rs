#[cfg(test)]
mod loopback;
#[cfg(test)]
mod unit;
