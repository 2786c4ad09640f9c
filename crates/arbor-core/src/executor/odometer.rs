/// Mixed-radix counter over candidate indices, first digit fastest.
///
/// Yields every combination once, starting from all zeros. A zero radix
/// yields nothing.
#[derive(Debug, Clone)]
pub(crate) struct Odometer {
    radices: Vec<usize>,
    digits: Vec<usize>,
    done: bool,
}

impl Odometer {
    pub(crate) fn new(radices: Vec<usize>) -> Self {
        let done = radices.iter().any(|r| *r == 0);
        Self {
            digits: vec![0; radices.len()],
            radices,
            done,
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.digits.clone();
        let mut i = 0;
        loop {
            if i == self.digits.len() {
                self.done = true;
                break;
            }
            self.digits[i] += 1;
            if self.digits[i] < self.radices[i] {
                break;
            }
            self.digits[i] = 0;
            i += 1;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odometer_visits_every_combination() {
        let all: Vec<_> = Odometer::new(vec![2, 3]).collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], vec![0, 0]);
        assert_eq!(all[1], vec![1, 0]);
        assert_eq!(all[5], vec![1, 2]);
    }

    #[test]
    fn test_odometer_edge_radices() {
        assert_eq!(Odometer::new(vec![3, 0]).count(), 0);
        assert_eq!(Odometer::new(vec![]).collect::<Vec<_>>(), vec![Vec::<usize>::new()]);
    }
}
