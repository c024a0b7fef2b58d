//! Condition codes for the kestrel code generator.
//!
//! A condition code is an emulated predicate over the four virtual status
//! flags (zero, sign, carry, overflow). Integer and floating point
//! comparisons follow different rules, so they use different types. Each
//! backend maps these to a native condition mask plus an optional invert
//! bit; ISAs that lack one of the flags synthesize it (see the S390x
//! backend).

use core::fmt;

/// Common behavior of condition codes.
pub trait Cond: Copy {
    /// The inverse predicate: `cc` holds iff `cc.inverse()` does not.
    #[must_use]
    fn inverse(self) -> Self;
}

/// Condition code for integer comparisons and flag tests.
///
/// `Less`..`LessEqual` interpret the operands as unsigned, the `Sig*` family
/// as signed. `Equal` doubles as the zero test and `Carry`/`Overflow` test
/// the corresponding emulated flag directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum CondCode {
    /// `==` (also: zero flag set).
    Equal,
    /// `!=` (also: zero flag clear).
    NotEqual,
    /// Unsigned `<`.
    Less,
    /// Unsigned `>=`.
    GreaterEqual,
    /// Unsigned `>`.
    Greater,
    /// Unsigned `<=`.
    LessEqual,
    /// Signed `<`.
    SigLess,
    /// Signed `>=`.
    SigGreaterEqual,
    /// Signed `>`.
    SigGreater,
    /// Signed `<=`.
    SigLessEqual,
    /// Signed overflow.
    Overflow,
    /// No signed overflow.
    NotOverflow,
    /// Carry flag set.
    Carry,
    /// Carry flag clear.
    NotCarry,
}

/// The zero test is the equal test under a different name.
pub const ZERO: CondCode = CondCode::Equal;
/// The not-zero test is the not-equal test under a different name.
pub const NOT_ZERO: CondCode = CondCode::NotEqual;

impl Cond for CondCode {
    fn inverse(self) -> Self {
        use self::CondCode::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            Less => GreaterEqual,
            GreaterEqual => Less,
            Greater => LessEqual,
            LessEqual => Greater,
            SigLess => SigGreaterEqual,
            SigGreaterEqual => SigLess,
            SigGreater => SigLessEqual,
            SigLessEqual => SigGreater,
            Overflow => NotOverflow,
            NotOverflow => Overflow,
            Carry => NotCarry,
            NotCarry => Carry,
        }
    }
}

impl CondCode {
    /// The predicate that produces the same result with swapped operands.
    #[must_use]
    pub fn reverse(self) -> Self {
        use self::CondCode::*;
        match self {
            Equal => Equal,
            NotEqual => NotEqual,
            Less => Greater,
            GreaterEqual => LessEqual,
            Greater => Less,
            LessEqual => GreaterEqual,
            SigLess => SigGreater,
            SigGreaterEqual => SigLessEqual,
            SigGreater => SigLess,
            SigLessEqual => SigGreaterEqual,
            Overflow => Overflow,
            NotOverflow => NotOverflow,
            Carry => Carry,
            NotCarry => NotCarry,
        }
    }

    /// Whether this predicate reads the operands as signed numbers.
    pub fn is_signed(self) -> bool {
        use self::CondCode::*;
        matches!(
            self,
            SigLess | SigGreaterEqual | SigGreater | SigLessEqual | Overflow | NotOverflow
        )
    }

    pub fn to_static_str(self) -> &'static str {
        use self::CondCode::*;
        match self {
            Equal => "equal",
            NotEqual => "not_equal",
            Less => "less",
            GreaterEqual => "greater_equal",
            Greater => "greater",
            LessEqual => "less_equal",
            SigLess => "sig_less",
            SigGreaterEqual => "sig_greater_equal",
            SigGreater => "sig_greater",
            SigLessEqual => "sig_less_equal",
            Overflow => "overflow",
            NotOverflow => "not_overflow",
            Carry => "carry",
            NotCarry => "not_carry",
        }
    }
}

impl fmt::Display for CondCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Condition code for double-precision comparisons.
///
/// Two IEEE values relate in exactly one of four ways: unordered (either is
/// NaN), equal, less or greater. `Equal`..`LessEqual` are false on
/// unordered inputs; `NotEqual` is true on them, matching the C `!=`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum FloatCond {
    /// EQ.
    Equal,
    /// UN | LT | GT.
    NotEqual,
    /// LT.
    Less,
    /// GT | EQ.
    GreaterEqual,
    /// GT.
    Greater,
    /// LT | EQ.
    LessEqual,
    /// EQ | LT | GT.
    Ordered,
    /// UN.
    Unordered,
}

impl Cond for FloatCond {
    fn inverse(self) -> Self {
        use self::FloatCond::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            Less => GreaterEqual,
            GreaterEqual => Less,
            Greater => LessEqual,
            LessEqual => Greater,
            Ordered => Unordered,
            Unordered => Ordered,
        }
    }
}

impl FloatCond {
    pub fn to_static_str(self) -> &'static str {
        use self::FloatCond::*;
        match self {
            Equal => "f_equal",
            NotEqual => "f_not_equal",
            Less => "f_less",
            GreaterEqual => "f_greater_equal",
            Greater => "f_greater",
            LessEqual => "f_less_equal",
            Ordered => "f_ordered",
            Unordered => "f_unordered",
        }
    }
}

impl fmt::Display for FloatCond {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static INT_ALL: [CondCode; 14] = [
        CondCode::Equal,
        CondCode::NotEqual,
        CondCode::Less,
        CondCode::GreaterEqual,
        CondCode::Greater,
        CondCode::LessEqual,
        CondCode::SigLess,
        CondCode::SigGreaterEqual,
        CondCode::SigGreater,
        CondCode::SigLessEqual,
        CondCode::Overflow,
        CondCode::NotOverflow,
        CondCode::Carry,
        CondCode::NotCarry,
    ];

    #[test]
    fn int_inverse() {
        for cc in &INT_ALL {
            let inv = cc.inverse();
            assert!(*cc != inv);
            assert_eq!(inv.inverse(), *cc);
        }
    }

    #[test]
    fn int_reverse() {
        for cc in &INT_ALL {
            assert_eq!(cc.reverse().reverse(), *cc);
        }
    }

    static FLOAT_ALL: [FloatCond; 8] = [
        FloatCond::Equal,
        FloatCond::NotEqual,
        FloatCond::Less,
        FloatCond::GreaterEqual,
        FloatCond::Greater,
        FloatCond::LessEqual,
        FloatCond::Ordered,
        FloatCond::Unordered,
    ];

    #[test]
    fn float_inverse() {
        for cc in &FLOAT_ALL {
            let inv = cc.inverse();
            assert!(*cc != inv);
            assert_eq!(inv.inverse(), *cc);
        }
    }
}
